//! Text-to-speech engine core: model ownership, generation parameters and
//! the blocking-to-async frame bridge used by the streaming server.

mod backend;
mod config;
mod encode;
mod engine;
mod error;
mod params;
mod piper;
mod producer;
pub mod scripted;

pub use backend::{AcceleratorInfo, AudioFrame, BackendLoader, Device, SpeechBackend};
pub use config::EngineConfig;
pub use encode::{decode_pcm16_base64, encode_pcm16_base64, quantize_sample};
pub use engine::{EngineStatus, ReadyInfo, SynthesisEngine};
pub use error::EngineError;
pub use params::{
    validate_cfg_coef, validate_temperature, GenerationParameters, SynthesisRequest, CFG_COEF_RANGE,
    TEMPERATURE_RANGE,
};
pub use piper::{load_voice_map, parse_voice_map, read_sample_rate, PiperBackend, PiperLoader};
pub use producer::{FrameEvent, FrameStream};
