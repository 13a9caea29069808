//! The seam between the engine and whatever model actually produces audio.
//!
//! A backend is an opaque capability: given text, a voice and generation
//! parameters, it produces audio frames one at a time through a callback.
//! Backends are blocking and are never called concurrently; the engine
//! guarantees exclusive access.

use std::{fmt, ops::ControlFlow, str::FromStr};

use serde::Serialize;

use crate::{config::EngineConfig, error::EngineError, params::SynthesisRequest};

/// Hardware the model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    /// Device to retry on when this one cannot host the model
    pub fn fallback(self) -> Option<Device> {
        match self {
            Device::Cuda => Some(Device::Cpu),
            Device::Cpu => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda => f.write_str("cuda"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "cpu" => Ok(Device::Cpu),
            other => Err(anyhow::anyhow!("Unknown device '{other}'. Expected 'cuda' or 'cpu'")),
        }
    }
}

/// One decoder output unit: mono samples in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as f64 / self.sample_rate as f64 * 1000.0) as u64
    }
}

/// Accelerator telemetry, reported best-effort by backends that run on one
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcceleratorInfo {
    pub cuda_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_allocated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_reserved: Option<u64>,
}

/// A loaded model owned exclusively by the engine
pub trait SpeechBackend: Send {
    fn device(&self) -> Device;

    /// Output rate of the default voice
    fn sample_rate(&self) -> u32;

    /// Voice catalog. May fail if the model cannot enumerate its voices.
    fn list_voices(&self) -> anyhow::Result<Vec<String>>;

    /// Run one full synthesis, calling `on_frame` once per decoded frame in
    /// generation order. Returning `Break` from the callback asks the backend
    /// to stop as soon as it can; that is not an error.
    fn synthesize(
        &mut self,
        request: &SynthesisRequest,
        on_frame: &mut dyn FnMut(AudioFrame) -> ControlFlow<()>,
    ) -> anyhow::Result<()>;

    fn accelerator(&self) -> Option<AcceleratorInfo> {
        None
    }
}

/// Loads a backend onto a device
pub trait BackendLoader: Send + Sync {
    /// Must return `EngineError::DeviceUnavailable` when `device` cannot host
    /// the model, so the engine can retry on the fallback device.
    fn load(&self, config: &EngineConfig, device: Device) -> Result<Box<dyn SpeechBackend>, EngineError>;
}
