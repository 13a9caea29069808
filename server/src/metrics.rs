// Synthesis and session counters for the /metrics endpoint

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::telemetry::{HostMemory, HostMonitor};

#[derive(Debug)]
pub struct SessionGuard {
    metrics: Arc<AppMetrics>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct AppMetrics {
    started_at: Instant,
    pub sessions_active: AtomicU64,
    pub sessions_total: AtomicU64,
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub total_synthesis_time_ms: AtomicU64,
    host: HostMonitor,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_active: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            total_synthesis_time_ms: AtomicU64::new(0),
            host: HostMonitor::default(),
        }
    }

    /// Count a new session. The gauge drops again when the guard does,
    /// even if the session task unwinds.
    pub fn session_opened(self: &Arc<Self>) -> SessionGuard {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn record_job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self, time_ms: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.total_synthesis_time_ms.fetch_add(time_ms, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean wall time of completed jobs, including time spent queued
    pub fn avg_synthesis_time_ms(&self) -> f64 {
        let count = self.jobs_completed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_synthesis_time_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    /// Cached host memory reading
    pub fn host_memory(&self) -> Option<HostMemory> {
        self.host.sample()
    }

    pub fn snapshot(&self) -> MetricsResponse {
        let host = self.host_memory();
        MetricsResponse {
            timestamp: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            avg_synthesis_time_ms: self.avg_synthesis_time_ms(),
            memory_used_mb: host.map(|h| h.memory_used_mb),
            memory_total_mb: host.map(|h| h.memory_total_mb),
            memory_usage_percent: host.map(|h| h.usage_percent()),
        }
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub sessions_active: u64,
    pub sessions_total: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub chunks_sent: u64,
    pub avg_synthesis_time_ms: f64,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub memory_usage_percent: Option<f32>,
}
