use thiserror::Error;
use tts_core::EngineError;

use crate::protocol::ServerMessage;

/// Errors reported to one connection as `error{message}`. None of them
/// close the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unparseable message or unknown command
    #[error("{0}")]
    Protocol(String),

    /// Bad input; no state was changed
    #[error("{0}")]
    Validation(String),

    #[error("TTS model not initialized")]
    EngineNotReady,

    #[error("Busy: {0}")]
    Busy(String),

    /// The job ended early; chunks already sent stand
    #[error("{0}")]
    Synthesis(String),
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotInitialized => SessionError::EngineNotReady,
            e if e.is_validation() => SessionError::Validation(e.to_string()),
            e => SessionError::Synthesis(e.to_string()),
        }
    }
}

impl SessionError {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            message: self.to_string(),
        }
    }
}
