use std::{path::PathBuf, time::Duration};

use crate::backend::Device;

/// Startup configuration for the engine. Read-only once the engine is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where model files live (Piper: directory of `.onnx` + `.onnx.json`)
    pub model_source: PathBuf,
    /// Voice catalog source (Piper: JSON voice map)
    pub voice_source: PathBuf,
    pub device: Device,
    pub default_voice: String,
    pub default_temperature: f64,
    pub default_cfg_coef: f64,
    /// Used until the loaded model reports its own rate
    pub sample_rate: u32,
    /// Optional safety bound on one synthesis job; unbounded when `None`
    pub synthesis_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_source: PathBuf::from("models"),
            voice_source: PathBuf::from("models/map.json"),
            device: Device::Cuda,
            default_voice: "en_US".to_string(),
            default_temperature: 0.6,
            default_cfg_coef: 2.0,
            sample_rate: 24_000,
            synthesis_timeout: None,
        }
    }
}
