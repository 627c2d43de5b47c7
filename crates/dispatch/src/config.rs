use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rough resident size of one loaded model.
pub const WORKER_MEMORY_MB: u64 = 1_200;

/// Resident size of the service itself, excluding workers.
pub const SERVICE_OVERHEAD_MB: u64 = 512;

/// Dispatcher tuning knobs.
///
/// Every field has a default, so a partial `[dispatch]` table is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of workers, fixed for the lifetime of the dispatcher.
    pub pool_size: usize,
    /// Maximum number of tasks waiting for a worker.
    pub max_queue_depth: usize,
    /// Maximum queued plus executing tasks.
    pub admission_ceiling: usize,
    /// Deadline for a task, counted from admission.
    pub task_timeout_ms: u64,
    /// Extra time a caller waits past the deadline before giving up on the
    /// dispatcher.
    pub result_margin_ms: u64,
    /// How often queued tasks are checked for expired deadlines.
    pub reap_interval_ms: u64,
    /// Attempts to start a replacement before a slot is written off.
    pub replacement_attempts: u32,
    /// Base delay between replacement attempts; grows linearly.
    pub replacement_backoff_ms: u64,
    /// Reclaim model memory after every task and recommend a smaller pool.
    pub memory_optimization: bool,
    /// Quarantine a worker after a clean recognition error too, not only after
    /// crashes and deadline overruns.
    pub quarantine_on_error: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_queue_depth: 32,
            admission_ceiling: 36,
            task_timeout_ms: 30_000,
            result_margin_ms: 250,
            reap_interval_ms: 100,
            replacement_attempts: 5,
            replacement_backoff_ms: 500,
            memory_optimization: false,
            quarantine_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Pool sizing advice for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub pool_size: usize,
    pub estimated_memory_mb: u64,
    pub hint: Option<String>,
}

impl DispatchConfig {
    /// Rejects settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("pool_size", self.pool_size as u64),
            ("max_queue_depth", self.max_queue_depth as u64),
            ("admission_ceiling", self.admission_ceiling as u64),
            ("task_timeout_ms", self.task_timeout_ms),
            ("reap_interval_ms", self.reap_interval_ms),
            ("replacement_attempts", u64::from(self.replacement_attempts)),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    /// Valid but questionable combinations, meant for a startup log.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.admission_ceiling < self.pool_size {
            out.push(format!(
                "admission_ceiling ({}) is below pool_size ({}); some workers will never be used",
                self.admission_ceiling, self.pool_size
            ));
        }
        if self.admission_ceiling > self.pool_size + self.max_queue_depth {
            out.push(format!(
                "admission_ceiling ({}) exceeds pool_size + max_queue_depth ({}); excess tasks are rejected as queue-full",
                self.admission_ceiling,
                self.pool_size + self.max_queue_depth
            ));
        }
        out
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn result_margin(&self) -> Duration {
        Duration::from_millis(self.result_margin_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn replacement_backoff(&self) -> Duration {
        Duration::from_millis(self.replacement_backoff_ms)
    }

    /// A caller may shorten the task timeout, never extend it.
    pub fn effective_timeout(&self, max_wait: Option<Duration>) -> Duration {
        match max_wait {
            Some(wait) => wait.min(self.task_timeout()),
            None => self.task_timeout(),
        }
    }

    /// Memory the configured pool is expected to hold.
    pub fn estimated_memory_mb(&self) -> u64 {
        self.pool_size as u64 * WORKER_MEMORY_MB + SERVICE_OVERHEAD_MB
    }

    /// Suggests a pool size for a host with `cpus` cores and `memory_mb` of RAM.
    pub fn recommend(&self, cpus: usize, memory_mb: u64) -> Recommendation {
        let by_memory = (memory_mb.saturating_sub(SERVICE_OVERHEAD_MB) / WORKER_MEMORY_MB).max(1) as usize;
        let mut pool_size = by_memory.min(cpus.max(1));
        if self.memory_optimization {
            pool_size = (pool_size / 2).max(1);
        }
        let estimated_memory_mb = pool_size as u64 * WORKER_MEMORY_MB + SERVICE_OVERHEAD_MB;
        let hint = if !self.memory_optimization && estimated_memory_mb > 4_096 {
            Some("enable memory_optimization to halve the pool and reclaim memory after each task".to_string())
        } else {
            None
        };
        Recommendation {
            pool_size,
            estimated_memory_mb,
            hint,
        }
    }
}
