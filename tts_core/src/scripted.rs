//! Deterministic backend that replays a fixed list of frames.
//!
//! Used by tests, and by the server when `TTS_BACKEND=scripted` to exercise
//! the wire protocol without model files.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use crate::{
    backend::{AudioFrame, BackendLoader, Device, SpeechBackend},
    config::EngineConfig,
    error::EngineError,
    params::SynthesisRequest,
};

/// Shared counters for observing a scripted backend from tests
#[derive(Debug, Clone, Default)]
pub struct ScriptProbe {
    requests: Arc<Mutex<Vec<SynthesisRequest>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    frames_emitted: Arc<AtomicUsize>,
}

impl ScriptProbe {
    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Highest number of overlapping `synthesize` calls seen
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn frames_emitted(&self) -> usize {
        self.frames_emitted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    frames: Vec<Vec<f32>>,
    sample_rate: u32,
    voices: Option<Vec<String>>,
    fail_after: Option<usize>,
    frame_delay: Duration,
    device: Device,
    probe: ScriptProbe,
}

impl ScriptedBackend {
    pub fn new(frames: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            frames,
            sample_rate,
            voices: Some(Vec::new()),
            fail_after: None,
            frame_delay: Duration::ZERO,
            device: Device::Cpu,
            probe: ScriptProbe::default(),
        }
    }

    /// `count` frames of `len` samples; every sample of frame `i` is `i / count`
    pub fn counting(count: usize, len: usize, sample_rate: u32) -> Self {
        let frames = (0..count)
            .map(|i| vec![i as f32 / count as f32; len])
            .collect();
        Self::new(frames, sample_rate)
    }

    /// A 440 Hz tone split into 80 ms frames
    pub fn tone(seconds: f32, sample_rate: u32) -> Self {
        let frame_len = (sample_rate as usize * 80 / 1000).max(1);
        let total = (seconds * sample_rate as f32) as usize;
        let samples: Vec<f32> = (0..total)
            .map(|n| {
                let t = n as f32 / sample_rate as f32;
                0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect();
        let frames = samples.chunks(frame_len).map(<[f32]>::to_vec).collect();
        Self::new(frames, sample_rate)
    }

    pub fn with_voices(mut self, voices: &[&str]) -> Self {
        self.voices = Some(voices.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Make `list_voices` fail
    pub fn with_failing_catalog(mut self) -> Self {
        self.voices = None;
        self
    }

    /// Emit `frames` frames, then fail
    pub fn with_fault_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Sleep between frames, simulating decode time
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        self.probe.clone()
    }

    fn run(
        &self,
        on_frame: &mut dyn FnMut(AudioFrame) -> ControlFlow<()>,
    ) -> anyhow::Result<()> {
        for (i, samples) in self.frames.iter().enumerate() {
            if self.fail_after == Some(i) {
                return Err(anyhow::anyhow!("simulated decoder fault after {i} frames"));
            }
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            self.probe.frames_emitted.fetch_add(1, Ordering::SeqCst);
            if on_frame(AudioFrame::new(samples.clone(), self.sample_rate)).is_break() {
                return Ok(());
            }
        }
        if let Some(n) = self.fail_after {
            if n >= self.frames.len() {
                return Err(anyhow::anyhow!("simulated decoder fault after {n} frames"));
            }
        }
        Ok(())
    }
}

impl SpeechBackend for ScriptedBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn list_voices(&self) -> anyhow::Result<Vec<String>> {
        self.voices
            .clone()
            .ok_or_else(|| anyhow::anyhow!("voice enumeration not supported"))
    }

    fn synthesize(
        &mut self,
        request: &SynthesisRequest,
        on_frame: &mut dyn FnMut(AudioFrame) -> ControlFlow<()>,
    ) -> anyhow::Result<()> {
        self.probe
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.run(on_frame);
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Hands out clones of a template backend, optionally refusing some devices
#[derive(Debug, Clone)]
pub struct ScriptedLoader {
    template: ScriptedBackend,
    unavailable: Vec<Device>,
}

impl ScriptedLoader {
    pub fn new(template: ScriptedBackend) -> Self {
        Self {
            template,
            unavailable: Vec::new(),
        }
    }

    pub fn with_unavailable(mut self, device: Device) -> Self {
        self.unavailable.push(device);
        self
    }
}

impl BackendLoader for ScriptedLoader {
    fn load(&self, _config: &EngineConfig, device: Device) -> Result<Box<dyn SpeechBackend>, EngineError> {
        if self.unavailable.contains(&device) {
            return Err(EngineError::DeviceUnavailable {
                device,
                reason: "disabled by script".to_string(),
            });
        }
        let mut backend = self.template.clone();
        backend.device = device;
        Ok(Box::new(backend))
    }
}
