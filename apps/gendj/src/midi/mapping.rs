//! Durable local state: the learned control table and the frame-stride
//! preference, stored as JSON text files under the platform data directory
//! and reloaded at startup.

use std::collections::HashMap;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Action, ControlKey, MessageKind};
use crate::frame::Stride;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no usable data directory on this platform")]
    NoDataDir,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Learned `(kind, channel, control) -> action` table. A key holds one
/// action; one action may be reachable from several keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredMapping", from = "StoredMapping")]
pub struct MidiMapping {
    bindings: HashMap<ControlKey, Action>,
}

impl MidiMapping {
    pub fn bind(&mut self, key: ControlKey, action: Action) {
        self.bindings.insert(key, action);
    }

    pub fn action_for(&self, key: ControlKey) -> Option<Action> {
        self.bindings.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMapping {
    bindings: Vec<StoredBinding>,
}

#[derive(Serialize, Deserialize)]
struct StoredBinding {
    kind: MessageKind,
    channel: u8,
    control: u8,
    action: Action,
}

impl From<MidiMapping> for StoredMapping {
    fn from(mapping: MidiMapping) -> Self {
        let mut bindings: Vec<StoredBinding> = mapping
            .bindings
            .into_iter()
            .map(|(key, action)| StoredBinding {
                kind: key.kind,
                channel: key.channel,
                control: key.control,
                action,
            })
            .collect();
        // Stable file contents regardless of hash order.
        bindings.sort_by_key(|b| (b.kind, b.channel, b.control));
        Self { bindings }
    }
}

impl From<StoredMapping> for MidiMapping {
    fn from(stored: StoredMapping) -> Self {
        let bindings = stored
            .bindings
            .into_iter()
            .map(|b| {
                (
                    ControlKey {
                        kind: b.kind,
                        channel: b.channel,
                        control: b.control,
                    },
                    b.action,
                )
            })
            .collect();
        Self { bindings }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Preferences {
    #[serde(default)]
    frame_drop_stride: Option<Stride>,
}

const MAPPING_FILE: &str = "midi_mapping.json";
const PREFERENCES_FILE: &str = "preferences.json";

/// File-backed store for the mapping table and stride preference.
pub struct MappingStore {
    root: PathBuf,
}

impl MappingStore {
    pub fn open_default() -> Result<Self, MappingError> {
        let dirs = ProjectDirs::from("com", "GenDJ", "gendj").ok_or(MappingError::NoDataDir)?;
        Ok(Self::at(dirs.data_dir().to_path_buf()))
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Missing file means a fresh install: an empty table, not an error.
    pub fn load_mapping(&self) -> Result<MidiMapping, MappingError> {
        match self.read(MAPPING_FILE)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| MappingError::Malformed {
                path: self.root.join(MAPPING_FILE),
                source,
            }),
            None => Ok(MidiMapping::default()),
        }
    }

    pub fn save_mapping(&self, mapping: &MidiMapping) -> Result<(), MappingError> {
        let raw =
            serde_json::to_string_pretty(mapping).map_err(|source| MappingError::Malformed {
                path: self.root.join(MAPPING_FILE),
                source,
            })?;
        self.write(MAPPING_FILE, &raw)
    }

    pub fn load_stride(&self) -> Result<Option<Stride>, MappingError> {
        match self.read(PREFERENCES_FILE)? {
            Some(raw) => {
                let preferences: Preferences =
                    serde_json::from_str(&raw).map_err(|source| MappingError::Malformed {
                        path: self.root.join(PREFERENCES_FILE),
                        source,
                    })?;
                Ok(preferences.frame_drop_stride)
            }
            None => Ok(None),
        }
    }

    pub fn save_stride(&self, stride: Stride) -> Result<(), MappingError> {
        let preferences = Preferences {
            frame_drop_stride: Some(stride),
        };
        let raw =
            serde_json::to_string_pretty(&preferences).map_err(|source| MappingError::Malformed {
                path: self.root.join(PREFERENCES_FILE),
                source,
            })?;
        self.write(PREFERENCES_FILE, &raw)
    }

    fn read(&self, file: &str) -> Result<Option<String>, MappingError> {
        let path = self.root.join(file);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(MappingError::Io { path, source }),
        }
    }

    fn write(&self, file: &str, contents: &str) -> Result<(), MappingError> {
        std::fs::create_dir_all(&self.root).map_err(|source| MappingError::Io {
            path: self.root.clone(),
            source,
        })?;
        let path = self.root.join(file);
        std::fs::write(&path, contents).map_err(|source| MappingError::Io { path, source })
    }
}
