//! Live controller bridge: opens every available MIDI input port and forwards
//! raw packets into the mapper's channel. Compiled only with the
//! `midi-hardware` feature so headless builds carry no system MIDI deps.

use midir::{MidiInput, MidiInputConnection};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("midi subsystem init failed: {0}")]
    Init(#[from] midir::InitError),
    #[error("no midi input ports available")]
    NoPorts,
}

pub struct MidiInputBridge {
    // Held for their lifetime; dropping a connection closes the port.
    _connections: Vec<MidiInputConnection<()>>,
}

impl MidiInputBridge {
    /// Connect to every input port and forward raw packets to `tx`.
    pub fn connect_all(tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<Self, InputError> {
        let probe = MidiInput::new("gendj-enum")?;
        let ports = probe.ports();
        if ports.is_empty() {
            return Err(InputError::NoPorts);
        }

        let mut connections = Vec::new();
        for (index, port) in ports.iter().enumerate() {
            let name = probe
                .port_name(port)
                .unwrap_or_else(|_| format!("midi-{index}"));
            let input = MidiInput::new("gendj-input")?;
            let tx = tx.clone();
            match input.connect(
                port,
                "gendj-input",
                move |_timestamp, message, _| {
                    let _ = tx.send(message.to_vec());
                },
                (),
            ) {
                Ok(connection) => {
                    info!(target: "gendj::midi", port = %name, "midi input connected");
                    connections.push(connection);
                }
                Err(err) => {
                    warn!(target: "gendj::midi", port = %name, error = %err, "midi connect failed");
                }
            }
        }
        if connections.is_empty() {
            return Err(InputError::NoPorts);
        }
        Ok(Self {
            _connections: connections,
        })
    }
}
