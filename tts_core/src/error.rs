use thiserror::Error;

use crate::backend::Device;

/// Engine error types
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("TTS model not initialized")]
    NotInitialized,

    #[error("Voice not found: {0}")]
    InvalidVoice(String),

    #[error("{name} must be between {min:?} and {max:?}")]
    OutOfRangeParameter {
        name: &'static str,
        min: f64,
        max: f64,
    },

    #[error("Device unavailable: {device} ({reason})")]
    DeviceUnavailable { device: Device, reason: String },

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Synthesis timed out after {0} seconds")]
    Timeout(u64),
}

impl EngineError {
    /// Validation errors leave engine state untouched and are the caller's fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidVoice(_) | EngineError::OutOfRangeParameter { .. }
        )
    }
}
