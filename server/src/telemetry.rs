// Hardware telemetry for `status` responses

use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::System;
use tts_core::AcceleratorInfo;

/// Host memory is re-read at most this often
pub const HOST_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// `gpu_info` in a status message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    #[serde(flatten)]
    pub accelerator: AcceleratorInfo,
    #[serde(flatten)]
    pub host: Option<HostMemory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostMemory {
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

impl HostMemory {
    /// `None` when the platform reports nothing
    fn read(system: &System) -> Option<Self> {
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(Self {
            memory_used_mb: system.used_memory() / 1024 / 1024,
            memory_total_mb: total / 1024 / 1024,
        })
    }

    pub fn usage_percent(&self) -> f32 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        (self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0) as f32
    }
}

struct HostCache {
    system: System,
    sampled: Option<(Instant, Option<HostMemory>)>,
}

/// One long-lived `System`, refreshed on demand but no more than once per
/// `interval`. Shared by every session and the metrics endpoint.
pub struct HostMonitor {
    interval: Duration,
    cache: Mutex<HostCache>,
}

impl std::fmt::Debug for HostMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMonitor")
            .field("interval", &self.interval)
            .finish()
    }
}

impl HostMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cache: Mutex::new(HostCache {
                system: System::new(),
                sampled: None,
            }),
        }
    }

    pub fn sample(&self) -> Option<HostMemory> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((at, memory)) = cache.sampled {
            if at.elapsed() < self.interval {
                return memory;
            }
        }
        cache.system.refresh_memory();
        let memory = HostMemory::read(&cache.system);
        cache.sampled = Some((Instant::now(), memory));
        memory
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new(HOST_REFRESH_INTERVAL)
    }
}

/// Accelerator info from the backend if it reported any, else `cuda_available: false`
pub fn gpu_info(accelerator: Option<AcceleratorInfo>, host: Option<HostMemory>) -> GpuInfo {
    GpuInfo {
        accelerator: accelerator.unwrap_or_default(),
        host,
    }
}
