use thiserror::Error;

use crate::mqtt::topic::TopicError;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The broker stayed unreachable after the inline reconnect attempt
    #[error("MQTT client not connected, message dropped")]
    NotConnected,

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("Runtime channel error: {0}")]
    ChannelError(String),
}
