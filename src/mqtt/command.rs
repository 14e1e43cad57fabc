//! JSON command decoding
//!
//! Commands carry no schema at this layer: any JSON object is accepted and
//! forwarded to the device side, which decides what the keys mean.

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Command must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Command channel error: {0}")]
    ChannelError(String),
}

/// A decoded command addressed to this node
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub topic: String,
    pub fields: Map<String, Value>,
}

impl DeviceCommand {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

pub trait CommandDecoder {
    /// Decodes `payload` and hands the command to the device side.
    fn decode(&mut self, topic: &str, payload: &[u8]) -> Result<(), CommandError>;
}

/// Decodes JSON objects and forwards them on a channel
pub struct JsonCommandDecoder {
    commands: mpsc::Sender<DeviceCommand>,
}

impl JsonCommandDecoder {
    pub fn new(commands: mpsc::Sender<DeviceCommand>) -> Self {
        JsonCommandDecoder { commands }
    }
}

pub fn parse_command(topic: &str, payload: &[u8]) -> Result<DeviceCommand, CommandError> {
    let fields = match serde_json::from_slice::<Value>(payload)? {
        Value::Object(fields) => fields,
        Value::Array(_) => return Err(CommandError::NotAnObject("array")),
        Value::String(_) => return Err(CommandError::NotAnObject("string")),
        Value::Number(_) => return Err(CommandError::NotAnObject("number")),
        Value::Bool(_) => return Err(CommandError::NotAnObject("bool")),
        Value::Null => return Err(CommandError::NotAnObject("null")),
    };

    Ok(DeviceCommand {
        topic: topic.to_string(),
        fields,
    })
}

impl CommandDecoder for JsonCommandDecoder {
    fn decode(&mut self, topic: &str, payload: &[u8]) -> Result<(), CommandError> {
        let command = parse_command(topic, payload)?;
        debug!("Decoded command with {} fields", command.fields.len());

        self.commands
            .try_send(command)
            .map_err(|e| CommandError::ChannelError(e.to_string()))
    }
}
