//! Bridges the engine's blocking, callback-driven synthesis into frames an
//! async consumer can pull one at a time.
//!
//! Each job gets a small async coordinator task which waits for the engine's
//! job permit (FIFO), then runs the backend on a blocking thread. The blocking
//! thread pushes frames into an unbounded channel; the coordinator pushes the
//! terminal event only after the blocking call has returned, so the consumer
//! sees every frame before `Completed` or `Failed`.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    backend::AudioFrame,
    engine::{elapsed_secs, text_preview, SynthesisEngine},
    error::EngineError,
    params::SynthesisRequest,
};

#[derive(Debug)]
pub enum FrameEvent {
    Frame(AudioFrame),
    /// The backend returned normally; no more frames follow
    Completed,
    /// The backend failed; frames already delivered stay valid
    Failed(EngineError),
}

impl FrameEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, FrameEvent::Frame(_))
    }
}

/// Consumer end of one synthesis job. Dropping it cancels the job.
#[derive(Debug)]
pub struct FrameStream {
    job_id: u64,
    rx: mpsc::UnboundedReceiver<FrameEvent>,
    cancel: Arc<AtomicBool>,
    coordinator: JoinHandle<()>,
    finished: bool,
}

impl FrameStream {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Next event in production order. Returns `None` once a terminal event
    /// has been handed out.
    pub async fn next_event(&mut self) -> Option<FrameEvent> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            // Sender side vanished without a terminal event
            None => FrameEvent::Failed(EngineError::Synthesis(
                "synthesis worker exited without a result".to_string(),
            )),
        };
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Ask the worker to stop. Frames already queued are discarded with the stream.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
        // A job still waiting for its permit leaves the queue here. A running
        // blocking thread keeps its permit until the backend notices `cancel`.
        self.coordinator.abort();
    }
}

pub(crate) fn spawn(
    engine: Arc<SynthesisEngine>,
    job_id: u64,
    request: SynthesisRequest,
    timeout: Option<Duration>,
) -> FrameStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let coordinator = tokio::spawn(coordinate(engine, job_id, request, timeout, tx, Arc::clone(&cancel)));
    FrameStream {
        job_id,
        rx,
        cancel,
        coordinator,
        finished: false,
    }
}

async fn coordinate(
    engine: Arc<SynthesisEngine>,
    job_id: u64,
    request: SynthesisRequest,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<FrameEvent>,
    cancel: Arc<AtomicBool>,
) {
    let permit = match Arc::clone(&engine.jobs).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            let _ = tx.send(FrameEvent::Failed(EngineError::Synthesis(
                "engine is shutting down".to_string(),
            )));
            return;
        }
    };
    if cancel.load(Ordering::Relaxed) {
        return;
    }

    info!(job = job_id, voice = %request.voice, "Synthesizing: {}...", text_preview(&request.text));
    let begin = Instant::now();

    let frame_tx = tx.clone();
    let worker_cancel = Arc::clone(&cancel);
    let worker_engine = Arc::clone(&engine);
    let worker = tokio::task::spawn_blocking(move || {
        // Held until the backend returns, even if the consumer is gone
        let _permit = permit;
        let mut frames = 0usize;
        let result = worker_engine.synthesize_blocking(&request, &mut |frame| {
            if worker_cancel.load(Ordering::Relaxed) {
                return ControlFlow::Break(());
            }
            frames += 1;
            match frame_tx.send(FrameEvent::Frame(frame)) {
                Ok(()) => ControlFlow::Continue(()),
                // Receiver dropped, stop processing
                Err(_) => ControlFlow::Break(()),
            }
        });
        (result, frames)
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, worker).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(job = job_id, "Synthesis timed out after {}s", limit.as_secs());
                let _ = tx.send(FrameEvent::Failed(EngineError::Timeout(limit.as_secs())));
                return;
            }
        },
        None => worker.await,
    };

    let event = match joined {
        Ok((Ok(()), frames)) => {
            if cancel.load(Ordering::Relaxed) {
                info!(job = job_id, "Synthesis cancelled after {frames} chunks");
            } else {
                info!(
                    job = job_id,
                    "Synthesis took {:.2}s, generated {frames} chunks",
                    elapsed_secs(begin)
                );
            }
            FrameEvent::Completed
        }
        Ok((Err(e), frames)) => {
            error!(job = job_id, "Synthesis failed after {frames} chunks: {e}");
            FrameEvent::Failed(e)
        }
        Err(join_err) => {
            error!(job = job_id, "Synthesis worker panicked: {join_err}");
            FrameEvent::Failed(EngineError::Synthesis(format!("synthesis worker panicked: {join_err}")))
        }
    };
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        scripted::{ScriptedBackend, ScriptedLoader},
    };

    fn ready_engine(backend: ScriptedBackend, timeout: Option<Duration>) -> Arc<SynthesisEngine> {
        let config = EngineConfig {
            default_voice: "alba".to_string(),
            synthesis_timeout: timeout,
            ..EngineConfig::default()
        };
        let engine = SynthesisEngine::new(config).unwrap();
        engine.initialize(&ScriptedLoader::new(backend)).unwrap();
        Arc::new(engine)
    }

    async fn drain(stream: &mut FrameStream) -> (Vec<AudioFrame>, FrameEvent) {
        let mut frames = Vec::new();
        while let Some(event) = stream.next_event().await {
            match event {
                FrameEvent::Frame(frame) => frames.push(frame),
                terminal => return (frames, terminal),
            }
        }
        panic!("stream ended without a terminal event");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_completed() {
        let engine = ready_engine(ScriptedBackend::counting(20, 16, 24_000), None);
        let request = engine.snapshot("hello", None).unwrap();
        let mut stream = engine.synthesize(request);
        let (frames, terminal) = drain(&mut stream).await;
        assert!(matches!(terminal, FrameEvent::Completed));
        assert_eq!(frames.len(), 20);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.samples[0], i as f32 / 20.0);
        }
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_after_partial_output() {
        let engine = ready_engine(ScriptedBackend::counting(5, 4, 24_000).with_fault_after(2), None);
        let request = engine.snapshot("boom", None).unwrap();
        let mut stream = engine.synthesize(request);
        let (frames, terminal) = drain(&mut stream).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(terminal, FrameEvent::Failed(EngineError::Synthesis(_))));
    }

    #[tokio::test]
    async fn test_engine_usable_after_failure() {
        let backend = ScriptedBackend::counting(3, 4, 24_000).with_fault_after(1);
        let engine = ready_engine(backend, None);
        let mut first = engine.synthesize(engine.snapshot("a", None).unwrap());
        let (_, terminal) = drain(&mut first).await;
        assert!(matches!(terminal, FrameEvent::Failed(_)));
        let mut second = engine.synthesize(engine.snapshot("b", None).unwrap());
        let (frames, terminal) = drain(&mut second).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(terminal, FrameEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let backend = ScriptedBackend::counting(4, 4, 24_000).with_frame_delay(Duration::from_millis(5));
        let probe = backend.probe();
        let engine = ready_engine(backend, None);
        let mut streams: Vec<FrameStream> = (0..4)
            .map(|i| engine.synthesize(engine.snapshot(&format!("job {i}"), None).unwrap()))
            .collect();
        for stream in streams.iter_mut() {
            let (frames, terminal) = drain(stream).await;
            assert_eq!(frames.len(), 4);
            assert!(matches!(terminal, FrameEvent::Completed));
        }
        assert_eq!(probe.max_concurrent(), 1);
        // Submission order is preserved
        let texts: Vec<String> = probe.requests().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["job 0", "job 1", "job 2", "job 3"]);
    }

    #[tokio::test]
    async fn test_drop_cancels_and_releases_permit() {
        let backend = ScriptedBackend::counting(200, 4, 24_000).with_frame_delay(Duration::from_millis(2));
        let probe = backend.probe();
        let engine = ready_engine(backend, None);
        let mut stream = engine.synthesize(engine.snapshot("long", None).unwrap());
        assert!(matches!(stream.next_event().await, Some(FrameEvent::Frame(_))));
        drop(stream);

        // The next job still gets the backend once the cancelled one stops
        let mut next = engine.synthesize(engine.snapshot("next", None).unwrap());
        let (frames, terminal) = tokio::time::timeout(Duration::from_secs(5), drain(&mut next))
            .await
            .unwrap();
        assert!(matches!(terminal, FrameEvent::Completed));
        assert_eq!(frames.len(), 200);
        assert!(probe.frames_emitted() < 400);
        assert_eq!(engine.jobs.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_drop_while_queued_leaves_the_queue() {
        let backend = ScriptedBackend::counting(20, 4, 24_000).with_frame_delay(Duration::from_millis(5));
        let probe = backend.probe();
        let engine = ready_engine(backend, None);
        let mut first = engine.synthesize(engine.snapshot("first", None).unwrap());
        assert!(matches!(first.next_event().await, Some(FrameEvent::Frame(_))));

        // Still waiting for the permit held by `first`
        let queued = engine.synthesize(engine.snapshot("queued", None).unwrap());
        drop(queued);
        let mut last = engine.synthesize(engine.snapshot("last", None).unwrap());

        let (frames, terminal) = drain(&mut first).await;
        assert_eq!(frames.len(), 19);
        assert!(matches!(terminal, FrameEvent::Completed));
        let (frames, terminal) = tokio::time::timeout(Duration::from_secs(5), drain(&mut last))
            .await
            .unwrap();
        assert_eq!(frames.len(), 20);
        assert!(matches!(terminal, FrameEvent::Completed));

        let texts: Vec<String> = probe.requests().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["first", "last"]);
        assert_eq!(engine.jobs.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_timeout_terminates_job() {
        let backend = ScriptedBackend::counting(100, 4, 24_000).with_frame_delay(Duration::from_millis(50));
        let engine = ready_engine(backend, Some(Duration::from_millis(120)));
        let mut stream = engine.synthesize(engine.snapshot("slow", None).unwrap());
        let (frames, terminal) = drain(&mut stream).await;
        assert!(frames.len() < 100);
        assert!(matches!(terminal, FrameEvent::Failed(EngineError::Timeout(_))));
    }
}
