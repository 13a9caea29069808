// Configuration for the server, read from the environment

use std::{path::PathBuf, str::FromStr, time::Duration};

use tts_core::{Device, EngineConfig};

/// Which backend produces audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Piper,
    /// Deterministic tone generator, no model files needed
    Scripted,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piper" => Ok(BackendKind::Piper),
            "scripted" => Ok(BackendKind::Scripted),
            other => Err(anyhow::anyhow!("Unknown TTS_BACKEND '{other}'. Expected 'piper' or 'scripted'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_source: PathBuf,
    pub voice_source: PathBuf,
    pub device: Device,
    pub default_voice: String,
    pub temperature: f64,
    pub cfg_coef: f64,
    pub synthesis_timeout_secs: Option<u64>,
    pub max_text_length: usize,
    pub backend: BackendKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8766,
            model_source: PathBuf::from("models"),
            voice_source: PathBuf::from("models/map.json"),
            device: Device::Cuda,
            default_voice: "en_US".to_string(),
            temperature: 0.6,
            cfg_coef: 2.0,
            synthesis_timeout_secs: None,
            max_text_length: 5000,
            backend: BackendKind::Piper,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = parsed("HOST").unwrap_or(defaults.host);
        let port = parsed("PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port);

        let model_source = parsed("MODEL_SOURCE").map(PathBuf::from).unwrap_or(defaults.model_source);
        let voice_source = parsed("VOICE_SOURCE").map(PathBuf::from).unwrap_or(defaults.voice_source);

        let device = parsed("DEVICE").and_then(|v| v.parse().ok()).unwrap_or(defaults.device);
        let default_voice = parsed("DEFAULT_VOICE").unwrap_or(defaults.default_voice);

        let temperature = parsed("TEMPERATURE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.temperature);

        let cfg_coef = parsed("CFG_COEF").and_then(|v| v.parse().ok()).unwrap_or(defaults.cfg_coef);

        let synthesis_timeout_secs = parsed("SYNTHESIS_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0);

        let max_text_length = parsed("MAX_TEXT_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_text_length);

        let backend = parsed("TTS_BACKEND").and_then(|v| v.parse().ok()).unwrap_or(defaults.backend);

        Self {
            host,
            port,
            model_source,
            voice_source,
            device,
            default_voice,
            temperature,
            cfg_coef,
            synthesis_timeout_secs,
            max_text_length,
            backend,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn synthesis_timeout(&self) -> Option<Duration> {
        self.synthesis_timeout_secs.map(Duration::from_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_source: self.model_source.clone(),
            voice_source: self.voice_source.clone(),
            device: self.device,
            default_voice: self.default_voice.clone(),
            default_temperature: self.temperature,
            default_cfg_coef: self.cfg_coef,
            synthesis_timeout: self.synthesis_timeout(),
            ..EngineConfig::default()
        }
    }
}
