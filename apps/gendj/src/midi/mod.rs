pub mod mapping;

#[cfg(feature = "midi-hardware")]
pub mod input;

use serde::{Deserialize, Serialize};
use tracing::warn;

use mapping::{MappingStore, MidiMapping};

/// The two message families a controller can be bound through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Cc,
    Note,
}

/// Identity of one physical control: message family, channel 1-16 and
/// controller/note number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlKey {
    pub kind: MessageKind,
    pub channel: u8,
    pub control: u8,
}

/// One decoded controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    pub kind: MessageKind,
    pub channel: u8,
    pub control: u8,
    pub value: u8,
}

impl MidiMessage {
    pub fn key(&self) -> ControlKey {
        ControlKey {
            kind: self.kind,
            channel: self.channel,
            control: self.control,
        }
    }
}

/// Decode a raw MIDI packet. Only control-change (0xB) and note-on (0x9)
/// status bytes are interesting; everything else is controller noise.
pub fn parse_message(raw: &[u8]) -> Option<MidiMessage> {
    if raw.len() < 3 {
        return None;
    }
    let status = raw[0];
    let channel = (status & 0x0f) + 1;
    let kind = match status >> 4 {
        0xb => MessageKind::Cc,
        0x9 => MessageKind::Note,
        _ => return None,
    };
    Some(MidiMessage {
        kind,
        channel,
        control: raw[1] & 0x7f,
        value: raw[2] & 0x7f,
    })
}

/// Whether a decoded message may take part in learning or dispatch.
/// High CC numbers are reserved/noise; a zero-velocity note-on is a note-off.
fn qualifies(message: &MidiMessage) -> bool {
    match message.kind {
        MessageKind::Cc => message.control <= 31,
        MessageKind::Note => message.value > 0,
    }
}

/// Logical deck action a control can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Fader,
    LoadFirstPrompt,
    LoadSecondPrompt,
    PromptSelectUp,
    PromptSelectDown,
    PromptSubmit,
    SecondPromptSubmit,
    PreviousCamera,
    NextCamera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnState {
    Idle,
    Learning { target: Action },
}

/// What the mapper made of one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperEvent {
    /// Learn mode captured this control for the target action.
    Learned { key: ControlKey, action: Action },
    /// A bound control fired; dispatch the action with the message value.
    Dispatch { action: Action, value: u8 },
}

/// Learned-control table plus the learn-mode state machine.
///
/// Learning is first-writer-wins: the first qualifying message after
/// `begin_learn` is bound and learning ends; later messages dispatch as
/// usual until learning is re-entered.
pub struct Mapper {
    mapping: MidiMapping,
    learn: LearnState,
    store: Option<MappingStore>,
}

impl Mapper {
    pub fn new(mapping: MidiMapping) -> Self {
        Self {
            mapping,
            learn: LearnState::Idle,
            store: None,
        }
    }

    /// Load the persisted table and keep persisting through `store`.
    pub fn with_store(store: MappingStore) -> Self {
        let mapping = store.load_mapping().unwrap_or_else(|err| {
            warn!(target: "gendj::midi", error = %err, "could not load midi mapping; starting empty");
            MidiMapping::default()
        });
        Self {
            mapping,
            learn: LearnState::Idle,
            store: Some(store),
        }
    }

    pub fn mapping(&self) -> &MidiMapping {
        &self.mapping
    }

    pub fn learn_state(&self) -> LearnState {
        self.learn
    }

    pub fn begin_learn(&mut self, action: Action) {
        self.learn = LearnState::Learning { target: action };
    }

    pub fn cancel_learn(&mut self) {
        self.learn = LearnState::Idle;
    }

    pub fn handle_raw(&mut self, raw: &[u8]) -> Option<MapperEvent> {
        parse_message(raw).and_then(|message| self.handle_message(message))
    }

    pub fn handle_message(&mut self, message: MidiMessage) -> Option<MapperEvent> {
        if !qualifies(&message) {
            return None;
        }
        match self.learn {
            LearnState::Learning { target } => {
                let key = message.key();
                self.mapping.bind(key, target);
                self.learn = LearnState::Idle;
                self.persist();
                Some(MapperEvent::Learned {
                    key,
                    action: target,
                })
            }
            LearnState::Idle => self
                .mapping
                .action_for(message.key())
                .map(|action| MapperEvent::Dispatch {
                    action,
                    value: message.value,
                }),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save_mapping(&self.mapping) {
                warn!(target: "gendj::midi", error = %err, "failed to persist midi mapping");
            }
        }
    }
}
