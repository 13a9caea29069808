//! Per-connection protocol state machine.
//!
//! A session is `Idle` or `Streaming` one job. It owns no engine state; it
//! reads and mutates the shared engine and pulls frames from the job's
//! stream. While streaming, `list_voices` and `status` are still answered and
//! every other command is rejected as busy.
//!
//! Chunks are sent one frame behind production so the last chunk of a job
//! can carry the final `total`.

use std::{ops::ControlFlow, sync::Arc, time::Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tts_core::{encode_pcm16_base64, AudioFrame, FrameEvent, FrameStream, SynthesisEngine};
use uuid::Uuid;

use crate::{
    error::SessionError,
    metrics::AppMetrics,
    protocol::{parse_command, ClientCommand, ServerMessage},
    telemetry,
    validation::validate_synthesis_text,
};

struct ActiveJob {
    stream: FrameStream,
    next_index: usize,
    pending: Option<AudioFrame>,
    started: Instant,
    audio_ms: u64,
}

impl ActiveJob {
    fn chunk(&mut self, frame: AudioFrame, last: bool) -> ServerMessage {
        let index = self.next_index;
        self.next_index += 1;
        self.audio_ms += frame.duration_ms();
        ServerMessage::AudioChunk {
            chunk: encode_pcm16_base64(&frame.samples),
            index,
            total: last.then_some(self.next_index),
            sample_rate: frame.sample_rate,
        }
    }
}

enum SessionState {
    Idle,
    Streaming(ActiveJob),
}

pub struct Session {
    id: Uuid,
    engine: Arc<SynthesisEngine>,
    metrics: Arc<AppMetrics>,
    max_text_length: usize,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: SessionState,
}

impl Session {
    pub fn new(
        id: Uuid,
        engine: Arc<SynthesisEngine>,
        metrics: Arc<AppMetrics>,
        max_text_length: usize,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            engine,
            metrics,
            max_text_length,
            outbound,
            state: SessionState::Idle,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, SessionState::Streaming(_))
    }

    /// Drive the session until the inbound side closes, the outbound side
    /// goes away, or shutdown is signalled. Any job still running is
    /// cancelled when the session is dropped.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        let mut watching_shutdown = true;

        loop {
            let flow = tokio::select! {
                message = inbound.recv() => match message {
                    Some(text) => self.handle_message(&text),
                    None => break,
                },
                event = next_job_event(&mut self.state), if self.is_streaming() => {
                    self.handle_job_event(event)
                }
                changed = shutdown.changed(), if watching_shutdown => match changed {
                    Ok(()) if *shutdown.borrow() => {
                        info!(session = %self.id, "Server shutting down, closing session");
                        break;
                    }
                    Ok(()) => ControlFlow::Continue(()),
                    // Nobody can signal shutdown any more
                    Err(_) => {
                        watching_shutdown = false;
                        ControlFlow::Continue(())
                    }
                },
            };
            if flow.is_break() {
                break;
            }
        }

        if let SessionState::Streaming(job) = &self.state {
            info!(session = %self.id, job = job.stream.job_id(), "Cancelling synthesis for closed session");
        }
    }

    fn handle_message(&mut self, text: &str) -> ControlFlow<()> {
        let command = match parse_command(text) {
            Ok(command) => command,
            Err(e) => {
                debug!(session = %self.id, "Rejected message: {e}");
                return self.send_error(e);
            }
        };
        debug!(session = %self.id, command = command.name(), "Received command");

        if self.is_streaming() && !command.is_read_only() {
            return self.send_error(SessionError::Busy(format!(
                "synthesis in progress, {} rejected",
                command.name()
            )));
        }

        match self.apply(command) {
            Ok(message) => self.send(message),
            Err(e) => self.send_error(e),
        }
    }

    fn apply(&mut self, command: ClientCommand) -> Result<ServerMessage, SessionError> {
        match command {
            ClientCommand::Synthesize { text, voice } => self.start_synthesis(text, voice),
            ClientCommand::ListVoices => {
                let (voices, current) = self.engine.list_voices()?;
                Ok(ServerMessage::Voices { voices, current })
            }
            ClientCommand::SetVoice { voice } => {
                let voice = voice.unwrap_or_else(|| self.engine.parameters().voice);
                let voice = self.engine.set_voice(&voice)?;
                Ok(ServerMessage::VoiceChanged { voice })
            }
            ClientCommand::SetTemperature { temperature } => {
                let temperature = temperature.unwrap_or_else(|| self.engine.parameters().temperature);
                let temperature = self.engine.set_temperature(temperature)?;
                Ok(ServerMessage::TemperatureChanged { temperature })
            }
            ClientCommand::SetCfgCoef { cfg_coef } => {
                let cfg_coef = cfg_coef.unwrap_or_else(|| self.engine.parameters().cfg_coef);
                let cfg_coef = self.engine.set_cfg_coef(cfg_coef)?;
                Ok(ServerMessage::CfgCoefChanged { cfg_coef })
            }
            ClientCommand::Status => {
                let status = self.engine.status();
                Ok(ServerMessage::Status {
                    initialized: status.initialized,
                    device: status.device,
                    current_voice: status.current_voice,
                    sample_rate: status.sample_rate,
                    temperature: status.temperature,
                    cfg_coef: status.cfg_coef,
                    gpu_info: telemetry::gpu_info(status.accelerator, self.metrics.host_memory()),
                })
            }
        }
    }

    fn start_synthesis(&mut self, text: String, voice: Option<String>) -> Result<ServerMessage, SessionError> {
        validate_synthesis_text(&text, self.max_text_length)?;
        let request = self.engine.snapshot(&text, voice.as_deref())?;
        let voice = request.voice.clone();

        let stream = self.engine.synthesize(request);
        info!(session = %self.id, job = stream.job_id(), voice = %voice, "Synthesis requested");
        self.metrics.record_job_started();
        self.state = SessionState::Streaming(ActiveJob {
            stream,
            next_index: 0,
            pending: None,
            started: Instant::now(),
            audio_ms: 0,
        });
        Ok(ServerMessage::SynthesisStarted { text, voice })
    }

    fn handle_job_event(&mut self, event: Option<FrameEvent>) -> ControlFlow<()> {
        let SessionState::Streaming(job) = &mut self.state else {
            return ControlFlow::Continue(());
        };

        match event {
            Some(FrameEvent::Frame(frame)) => match job.pending.replace(frame) {
                Some(previous) => {
                    let chunk = job.chunk(previous, false);
                    self.send_chunk(chunk)
                }
                None => ControlFlow::Continue(()),
            },
            Some(FrameEvent::Completed) => {
                let last = job.pending.take().map(|frame| job.chunk(frame, true));
                let total_chunks = job.next_index;
                let audio_ms = job.audio_ms;
                let elapsed_ms = job.started.elapsed().as_millis() as u64;
                self.state = SessionState::Idle;

                if let Some(chunk) = last {
                    self.send_chunk(chunk)?;
                }
                self.metrics.record_job_completed(elapsed_ms);
                debug!(
                    session = %self.id,
                    "Streamed {total_chunks} chunks ({audio_ms}ms of audio) in {elapsed_ms}ms"
                );
                self.send(ServerMessage::SynthesisCompleted { total_chunks })
            }
            Some(FrameEvent::Failed(e)) => {
                // Frames produced before the fault are still delivered
                let flushed = job.pending.take().map(|frame| job.chunk(frame, false));
                self.state = SessionState::Idle;

                if let Some(chunk) = flushed {
                    self.send_chunk(chunk)?;
                }
                self.metrics.record_job_failed();
                warn!(session = %self.id, "Synthesis failed: {e}");
                self.send_error(SessionError::from(e))
            }
            None => {
                self.state = SessionState::Idle;
                ControlFlow::Continue(())
            }
        }
    }

    fn send_chunk(&self, chunk: ServerMessage) -> ControlFlow<()> {
        self.metrics.record_chunk();
        self.send(chunk)
    }

    fn send_error(&self, error: SessionError) -> ControlFlow<()> {
        self.send(error.to_message())
    }

    fn send(&self, message: ServerMessage) -> ControlFlow<()> {
        match self.outbound.send(message) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => {
                debug!(session = %self.id, "Outbound channel closed");
                ControlFlow::Break(())
            }
        }
    }
}

async fn next_job_event(state: &mut SessionState) -> Option<FrameEvent> {
    match state {
        SessionState::Streaming(job) => job.stream.next_event().await,
        SessionState::Idle => std::future::pending().await,
    }
}
