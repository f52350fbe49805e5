use std::sync::Arc;

use crate::messages::{ErrorCondition, MessageError};

/// Everything an operation or a circuit can fail with.
///
/// Completion callbacks receive one of these as their error result; nothing in
/// the engine raises transport failures any other way.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ClientError {
    #[error("{0}")]
    IO(Arc<std::io::Error>),
    #[error("Failed to parse message from server: {0}")]
    Malformed(String),
    #[error("The circuit to the server was lost")]
    Disconnected,
    #[error("Timed out waiting for the operation")]
    Timeout,
    #[error("Send backlog exceeded {limit} bytes")]
    BackpressureExceeded { limit: usize },
    #[error("The server version ({0}) was incompatible")]
    ProtocolVersionMismatch(u16),
    #[error("Completion arrived for an operation that was already retired")]
    StaleCompletion,
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("Server reported: {0}")]
    Server(ErrorCondition),
    #[error("Channel creation failed")]
    ChannelCreateFailed,
    #[error("The operation was cancelled")]
    Cancelled,
    #[error("No conversion between the server and requested types")]
    NoConvert,
    #[error("No access rights for the operation")]
    AccessDenied,
    #[error("Could not find PV {0}")]
    NotFound(String),
    #[error("The Client is closing or has closed")]
    ClientClosed,
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::IO(Arc::new(value))
    }
}

impl From<MessageError> for ClientError {
    fn from(value: MessageError) -> Self {
        match value {
            MessageError::IO(e) => ClientError::IO(Arc::new(e)),
            other => ClientError::Malformed(other.to_string()),
        }
    }
}

impl From<ErrorCondition> for ClientError {
    fn from(value: ErrorCondition) -> Self {
        match value {
            ErrorCondition::NoConvert => ClientError::NoConvert,
            ErrorCondition::Disconn => ClientError::Disconnected,
            other => ClientError::Server(other),
        }
    }
}

impl ClientError {
    /// Errors after which the circuit that produced them cannot continue
    pub fn is_fatal_to_circuit(&self) -> bool {
        matches!(
            self,
            ClientError::IO(_)
                | ClientError::Malformed(_)
                | ClientError::BackpressureExceeded { .. }
                | ClientError::ProtocolVersionMismatch(_)
                | ClientError::Disconnected
        )
    }
}
