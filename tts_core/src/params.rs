//! Mutable generation parameters and the per-request snapshot taken from them.

use serde::Serialize;

use crate::error::EngineError;

/// Accepted temperature range (inclusive)
pub const TEMPERATURE_RANGE: (f64, f64) = (0.1, 2.0);
/// Accepted guidance coefficient range (inclusive)
pub const CFG_COEF_RANGE: (f64, f64) = (0.5, 5.0);

/// Parameters shared by every session. Only the engine mutates them, under its lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParameters {
    pub voice: String,
    pub temperature: f64,
    pub cfg_coef: f64,
}

impl GenerationParameters {
    pub fn new(voice: impl Into<String>, temperature: f64, cfg_coef: f64) -> Result<Self, EngineError> {
        Ok(Self {
            voice: voice.into(),
            temperature: check_range("Temperature", temperature, TEMPERATURE_RANGE)?,
            cfg_coef: check_range("CFG coefficient", cfg_coef, CFG_COEF_RANGE)?,
        })
    }
}

pub fn validate_temperature(value: f64) -> Result<f64, EngineError> {
    check_range("Temperature", value, TEMPERATURE_RANGE)
}

pub fn validate_cfg_coef(value: f64) -> Result<f64, EngineError> {
    check_range("CFG coefficient", value, CFG_COEF_RANGE)
}

fn check_range(name: &'static str, value: f64, (min, max): (f64, f64)) -> Result<f64, EngineError> {
    // NaN fails both comparisons and is rejected here too
    if value >= min && value <= max {
        Ok(value)
    } else {
        Err(EngineError::OutOfRangeParameter { name, min, max })
    }
}

/// One synthesis job. The parameter values are fixed when the request is built,
/// so later `set_*` calls from other sessions never affect it.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub temperature: f64,
    pub cfg_coef: f64,
}

impl SynthesisRequest {
    pub(crate) fn from_snapshot(text: String, voice: String, params: &GenerationParameters) -> Self {
        Self {
            text,
            voice,
            temperature: params.temperature,
            cfg_coef: params.cfg_coef,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_bounds() {
        assert!(validate_temperature(0.1).is_ok());
        assert!(validate_temperature(2.0).is_ok());
        assert!(validate_temperature(0.6).is_ok());
        assert!(validate_temperature(0.05).is_err());
        assert!(validate_temperature(2.5).is_err());
        assert!(validate_temperature(f64::NAN).is_err());
    }

    #[test]
    fn test_cfg_coef_bounds() {
        assert!(validate_cfg_coef(0.5).is_ok());
        assert!(validate_cfg_coef(5.0).is_ok());
        assert!(validate_cfg_coef(0.49).is_err());
        assert!(validate_cfg_coef(5.01).is_err());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = validate_temperature(2.5).unwrap_err();
        assert_eq!(err.to_string(), "Temperature must be between 0.1 and 2.0");
        assert!(err.is_validation());
        let err = validate_cfg_coef(6.0).unwrap_err();
        assert_eq!(err.to_string(), "CFG coefficient must be between 0.5 and 5.0");
    }

    #[test]
    fn test_new_rejects_bad_defaults() {
        assert!(GenerationParameters::new("v", 0.6, 2.0).is_ok());
        assert!(GenerationParameters::new("v", 3.0, 2.0).is_err());
        assert!(GenerationParameters::new("v", 0.6, 0.0).is_err());
    }
}
