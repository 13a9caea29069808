//! Piper (ONNX) backend.
//!
//! Voices come from a JSON voice map:
//!
//! ```json
//! {
//!   "en_US": "en_US/en_US-lessac-medium.onnx.json",
//!   "de_DE": { "config": "de_DE/de_DE-thorsten-medium.onnx.json" },
//!   "fr_FR": {
//!     "default_voice": "siwis",
//!     "voices": { "siwis": { "config": "fr_FR/fr_FR-siwis-medium.onnx.json" } }
//!   }
//! }
//! ```
//!
//! Relative config paths resolve against the model source directory. A voice
//! id missing from the map is tried as a config path itself, so a single
//! default voice works without any map.

use std::{
    collections::BTreeMap,
    fs,
    num::NonZeroUsize,
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use anyhow::Context;
use lru::LruCache;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use tracing::{debug, info};

use crate::{
    backend::{AudioFrame, BackendLoader, Device, SpeechBackend},
    config::EngineConfig,
    error::EngineError,
    params::SynthesisRequest,
};

/// Synthesizers kept loaded at once
const MAX_LOADED_VOICES: usize = 4;

pub struct PiperLoader;

impl BackendLoader for PiperLoader {
    fn load(&self, config: &EngineConfig, device: Device) -> Result<Box<dyn SpeechBackend>, EngineError> {
        if device != Device::Cpu {
            return Err(EngineError::DeviceUnavailable {
                device,
                reason: "piper runs on the CPU execution provider only".to_string(),
            });
        }
        let backend = PiperBackend::open(config).map_err(|e| EngineError::Load(format!("{e:#}")))?;
        Ok(Box::new(backend))
    }
}

struct CachedSynth {
    synth: PiperSpeechSynthesizer,
    sample_rate: u32,
}

pub struct PiperBackend {
    model_root: PathBuf,
    // Err keeps the reason enumeration failed
    voices: Result<BTreeMap<String, PathBuf>, String>,
    sample_rate: u32,
    synths: LruCache<PathBuf, CachedSynth>,
}

impl PiperBackend {
    /// Read the voice map and load the default voice. Fails if the default
    /// voice cannot be loaded; a missing or broken map is tolerated.
    pub fn open(config: &EngineConfig) -> anyhow::Result<Self> {
        let voices = load_voice_map(&config.voice_source, &config.model_source).map_err(|e| format!("{e:#}"));
        if let Err(reason) = &voices {
            info!("No usable voice map ({reason})");
        }

        let capacity = NonZeroUsize::new(MAX_LOADED_VOICES).unwrap_or(NonZeroUsize::MIN);
        let mut backend = Self {
            model_root: config.model_source.clone(),
            voices,
            sample_rate: config.sample_rate,
            synths: LruCache::new(capacity),
        };

        let default_cfg = backend.resolve(&config.default_voice);
        info!("Loading model from {}", default_cfg.display());
        backend.sample_rate = backend
            .synth_for(&default_cfg)
            .with_context(|| format!("failed to load default voice '{}'", config.default_voice))?
            .sample_rate;
        Ok(backend)
    }

    fn resolve(&self, voice: &str) -> PathBuf {
        match &self.voices {
            Ok(map) if map.contains_key(voice) => map[voice].clone(),
            _ => resolve_path(&self.model_root, voice),
        }
    }

    fn synth_for(&mut self, cfg_path: &Path) -> anyhow::Result<&CachedSynth> {
        if !self.synths.contains(cfg_path) {
            let sample_rate = read_sample_rate(cfg_path)?;
            let model = piper_rs::from_config_path(cfg_path)
                .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
            let synth = PiperSpeechSynthesizer::new(model)?;
            debug!("Loaded voice config {}", cfg_path.display());
            self.synths.put(cfg_path.to_path_buf(), CachedSynth { synth, sample_rate });
        }
        self.synths
            .get(cfg_path)
            .ok_or_else(|| anyhow::anyhow!("voice {} was evicted while loading", cfg_path.display()))
    }
}

impl SpeechBackend for PiperBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn list_voices(&self) -> anyhow::Result<Vec<String>> {
        match &self.voices {
            Ok(map) => Ok(map.keys().cloned().collect()),
            Err(reason) => Err(anyhow::anyhow!("{reason}")),
        }
    }

    fn synthesize(
        &mut self,
        request: &SynthesisRequest,
        on_frame: &mut dyn FnMut(AudioFrame) -> ControlFlow<()>,
    ) -> anyhow::Result<()> {
        // Piper's noise scales are fixed by the voice config
        debug!(
            temperature = request.temperature,
            cfg_coef = request.cfg_coef,
            "piper ignores sampling parameters"
        );
        let cfg_path = self.resolve(&request.voice);
        let cached = self.synth_for(&cfg_path)?;
        let stream: PiperSpeechStreamParallel = cached
            .synth
            .synthesize_parallel(request.text.clone(), None)
            .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;

        for part in stream {
            let samples = part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?.into_vec();
            if on_frame(AudioFrame::new(samples, cached.sample_rate)).is_break() {
                break;
            }
        }
        Ok(())
    }
}

fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Load a voice map file
pub fn load_voice_map(map_path: &Path, model_root: &Path) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let text = fs::read_to_string(map_path)
        .with_context(|| format!("Failed to load {}", map_path.display()))?;
    parse_voice_map(&text, model_root)
}

/// Parse voice map JSON into voice id -> config path
pub fn parse_voice_map(text: &str, model_root: &Path) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let json: serde_json::Value = serde_json::from_str(text).with_context(|| "voice map is not valid JSON")?;
    let obj = json
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("voice map must be a JSON object"))?;

    let mut voices = BTreeMap::new();
    for (key, value) in obj {
        match value {
            serde_json::Value::String(path) => {
                voices.insert(key.clone(), resolve_path(model_root, path));
            }
            serde_json::Value::Object(o) if o.contains_key("voices") => {
                let nested = o
                    .get("voices")
                    .and_then(|x| x.as_object())
                    .ok_or_else(|| anyhow::anyhow!("'voices' for {key} must be an object"))?;
                for (voice_id, entry) in nested {
                    let config = entry
                        .get("config")
                        .and_then(|x| x.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing 'config' for voice {voice_id}"))?;
                    voices.insert(voice_id.clone(), resolve_path(model_root, config));
                }
            }
            serde_json::Value::Object(o) => {
                let config = o
                    .get("config")
                    .and_then(|x| x.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing 'config' for key {key}"))?;
                voices.insert(key.clone(), resolve_path(model_root, config));
            }
            _ => {
                return Err(anyhow::anyhow!(
                    "invalid entry for key {key} (expected string or object)"
                ));
            }
        }
    }
    Ok(voices)
}

/// Read sample rate from a Piper model config JSON
pub fn read_sample_rate(cfg_path: &Path) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path)
        .with_context(|| format!("Failed to read config file: {}", cfg_path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&text).with_context(|| "Config file is not valid JSON")?;

    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;

    u32::try_from(sample_rate).with_context(|| format!("sample rate {sample_rate} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_all_entry_shapes() {
        let json = r#"{
            "en_US": "en_US/lessac.onnx.json",
            "de_DE": { "config": "/abs/thorsten.onnx.json" },
            "fr_FR": {
                "default_voice": "siwis",
                "voices": { "siwis": { "config": "fr_FR/siwis.onnx.json" } }
            }
        }"#;
        let voices = parse_voice_map(json, Path::new("models")).unwrap();
        assert_eq!(voices.len(), 3);
        assert_eq!(voices["en_US"], PathBuf::from("models/en_US/lessac.onnx.json"));
        assert_eq!(voices["de_DE"], PathBuf::from("/abs/thorsten.onnx.json"));
        assert_eq!(voices["siwis"], PathBuf::from("models/fr_FR/siwis.onnx.json"));
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(parse_voice_map("[]", Path::new("m")).is_err());
        assert!(parse_voice_map(r#"{"x": 3}"#, Path::new("m")).is_err());
        assert!(parse_voice_map(r#"{"x": {"speaker": 1}}"#, Path::new("m")).is_err());
        assert!(parse_voice_map("not json", Path::new("m")).is_err());
    }

    #[test]
    fn test_read_sample_rate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"audio": {{"sample_rate": 22050}}}}"#).unwrap();
        assert_eq!(read_sample_rate(file.path()).unwrap(), 22050);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{"audio": {{}}}}"#).unwrap();
        assert!(read_sample_rate(bad.path()).is_err());
    }

    #[test]
    fn test_cuda_is_unavailable() {
        let result = PiperLoader.load(&EngineConfig::default(), Device::Cuda);
        assert!(matches!(result, Err(EngineError::DeviceUnavailable { device: Device::Cuda, .. })));
    }

    #[test]
    fn test_missing_default_voice_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            model_source: dir.path().to_path_buf(),
            voice_source: dir.path().join("map.json"),
            default_voice: "missing.onnx.json".to_string(),
            ..EngineConfig::default()
        };
        let result = PiperLoader.load(&config, Device::Cpu);
        assert!(matches!(result, Err(EngineError::Load(_))));
    }
}
