//! The synthesis engine: exclusive owner of the loaded model.
//!
//! Two locks, never held together from async code:
//! - `state` guards generation parameters and readiness info. It is only held
//!   for short, non-blocking sections, so sessions may take it on the event loop.
//! - `backend` guards the model itself and is only taken on blocking threads.
//!
//! Jobs are additionally serialized system-wide by a fair one-permit semaphore
//! (see [`crate::producer`]), which gives first-come first-served ordering
//! across connections.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Instant,
};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    backend::{AcceleratorInfo, AudioFrame, BackendLoader, Device, SpeechBackend},
    config::EngineConfig,
    error::EngineError,
    params::{validate_cfg_coef, validate_temperature, GenerationParameters, SynthesisRequest},
    producer::{self, FrameStream},
};

/// What `initialize` learned from the loaded model
#[derive(Debug, Clone, Serialize)]
pub struct ReadyInfo {
    pub device: Device,
    pub sample_rate: u32,
    pub voices: Vec<String>,
}

/// Read-only snapshot for `status` requests
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub device: Device,
    pub current_voice: String,
    pub sample_rate: u32,
    pub temperature: f64,
    pub cfg_coef: f64,
    pub accelerator: Option<AcceleratorInfo>,
}

struct EngineState {
    params: GenerationParameters,
    ready: Option<ReadyInfo>,
    accelerator: Option<AcceleratorInfo>,
}

pub struct SynthesisEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    backend: Mutex<Option<Box<dyn SpeechBackend>>>,
    pub(crate) jobs: Arc<Semaphore>,
    next_job_id: AtomicU64,
}

impl std::fmt::Debug for SynthesisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisEngine")
            .field("config", &self.config)
            .field("backend", &"<SpeechBackend>")
            .finish()
    }
}

impl SynthesisEngine {
    /// Create an engine that is not yet initialized. Fails only if the
    /// configured default parameters are out of range.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let params = GenerationParameters::new(
            config.default_voice.clone(),
            config.default_temperature,
            config.default_cfg_coef,
        )?;
        Ok(Self {
            config,
            state: Mutex::new(EngineState {
                params,
                ready: None,
                accelerator: None,
            }),
            backend: Mutex::new(None),
            jobs: Arc::new(Semaphore::new(1)),
            next_job_id: AtomicU64::new(1),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        // Nothing panics while holding this lock; recover rather than propagate
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the model. Blocking: run it before serving or inside `spawn_blocking`.
    ///
    /// Falls back to the secondary device when the configured one is
    /// unavailable. A model that cannot enumerate voices gets a catalog of
    /// just the default voice, and the default voice is always in the catalog.
    pub fn initialize(&self, loader: &dyn BackendLoader) -> Result<ReadyInfo, EngineError> {
        let requested = self.config.device;
        info!("Initializing TTS model on {requested}...");
        let backend = match loader.load(&self.config, requested) {
            Ok(backend) => backend,
            Err(EngineError::DeviceUnavailable { device, reason }) => {
                let Some(fallback) = device.fallback() else {
                    return Err(EngineError::DeviceUnavailable { device, reason });
                };
                warn!("{device} not available ({reason}), falling back to {fallback}");
                loader.load(&self.config, fallback)?
            }
            Err(e) => return Err(e),
        };

        let default_voice = self.config.default_voice.clone();
        let voices = match backend.list_voices() {
            Ok(mut voices) if !voices.is_empty() => {
                if !voices.contains(&default_voice) {
                    warn!("Default voice {default_voice} not in model catalog, adding it");
                    voices.push(default_voice);
                }
                info!("Available voices: {}", voices.len());
                voices
            }
            Ok(_) => {
                info!("Model reports no voices, using default voice: {default_voice}");
                vec![default_voice]
            }
            Err(e) => {
                warn!("Could not enumerate voices ({e}), using default voice: {default_voice}");
                vec![default_voice]
            }
        };

        let ready = ReadyInfo {
            device: backend.device(),
            sample_rate: backend.sample_rate(),
            voices,
        };
        let accelerator = backend.accelerator();

        *self.backend.lock().unwrap_or_else(PoisonError::into_inner) = Some(backend);
        {
            let mut state = self.state();
            state.ready = Some(ready.clone());
            state.accelerator = accelerator;
        }
        info!(
            "TTS model initialized on {} with sample rate {}",
            ready.device, ready.sample_rate
        );
        Ok(ready)
    }

    pub fn is_initialized(&self) -> bool {
        self.state().ready.is_some()
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state();
        EngineStatus {
            initialized: state.ready.is_some(),
            device: state.ready.as_ref().map_or(self.config.device, |r| r.device),
            current_voice: state.params.voice.clone(),
            sample_rate: state.ready.as_ref().map_or(self.config.sample_rate, |r| r.sample_rate),
            temperature: state.params.temperature,
            cfg_coef: state.params.cfg_coef,
            accelerator: state.accelerator.clone(),
        }
    }

    pub fn parameters(&self) -> GenerationParameters {
        self.state().params.clone()
    }

    /// Voice catalog and the current voice
    pub fn list_voices(&self) -> Result<(Vec<String>, String), EngineError> {
        let state = self.state();
        let ready = state.ready.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok((ready.voices.clone(), state.params.voice.clone()))
    }

    /// Switch the shared current voice. Only catalog voices are accepted;
    /// re-selecting the current voice is a no-op.
    pub fn set_voice(&self, voice: &str) -> Result<String, EngineError> {
        let mut state = self.state();
        let ready = state.ready.as_ref().ok_or(EngineError::NotInitialized)?;
        if !ready.voices.iter().any(|v| v == voice) {
            return Err(EngineError::InvalidVoice(voice.to_string()));
        }
        if state.params.voice != voice {
            info!("Switching to voice: {voice}");
            state.params.voice = voice.to_string();
        }
        Ok(state.params.voice.clone())
    }

    pub fn set_temperature(&self, temperature: f64) -> Result<f64, EngineError> {
        let temperature = validate_temperature(temperature)?;
        self.state().params.temperature = temperature;
        debug!("Temperature set to {temperature}");
        Ok(temperature)
    }

    pub fn set_cfg_coef(&self, cfg_coef: f64) -> Result<f64, EngineError> {
        let cfg_coef = validate_cfg_coef(cfg_coef)?;
        self.state().params.cfg_coef = cfg_coef;
        debug!("CFG coefficient set to {cfg_coef}");
        Ok(cfg_coef)
    }

    /// Build a request from the current parameters in one critical section.
    /// An omitted or empty voice means the current voice.
    pub fn snapshot(&self, text: &str, voice: Option<&str>) -> Result<SynthesisRequest, EngineError> {
        let state = self.state();
        let ready = state.ready.as_ref().ok_or(EngineError::NotInitialized)?;
        let voice = match voice.map(str::trim) {
            Some(v) if !v.is_empty() => v,
            _ => state.params.voice.as_str(),
        };
        if !ready.voices.iter().any(|v| v == voice) {
            return Err(EngineError::InvalidVoice(voice.to_string()));
        }
        Ok(SynthesisRequest::from_snapshot(
            text.to_string(),
            voice.to_string(),
            &state.params,
        ))
    }

    /// Run one request to completion on the calling thread.
    ///
    /// Blocking. Callers that also need FIFO ordering across jobs should go
    /// through [`SynthesisEngine::synthesize`] instead.
    pub fn synthesize_blocking(
        &self,
        request: &SynthesisRequest,
        on_frame: &mut dyn FnMut(AudioFrame) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let mut guard = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        let backend = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let result = backend
            .synthesize(request, on_frame)
            .map_err(|e| EngineError::Synthesis(format!("{e:#}")));
        // Refresh telemetry while we still hold the backend
        let accelerator = backend.accelerator();
        drop(guard);
        self.state().accelerator = accelerator;
        result
    }

    /// Start a job on a dedicated worker and return the consumer end of its
    /// frame channel. Never blocks the caller.
    pub fn synthesize(self: &Arc<Self>, request: SynthesisRequest) -> FrameStream {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        if self.jobs.available_permits() == 0 {
            debug!(job = job_id, "Synthesis queued behind an active job");
        }
        producer::spawn(Arc::clone(self), job_id, request, self.config.synthesis_timeout)
    }
}

pub(crate) fn text_preview(text: &str) -> String {
    text.chars().take(50).collect()
}

pub(crate) fn elapsed_secs(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
