//! Progress events and the sinks that receive them.

use crate::error::ErrorBody;
use crate::types::LookupResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lookup stage an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Validating,
    CacheCheck,
    Fetching { attempt: usize },
    Extracting,
    CacheWrite,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validating => f.write_str("validating"),
            Stage::CacheCheck => f.write_str("cache_check"),
            Stage::Fetching { attempt } => write!(f, "fetching (attempt {})", attempt),
            Stage::Extracting => f.write_str("extracting"),
            Stage::CacheWrite => f.write_str("cache_write"),
            Stage::Done => f.write_str("done"),
            Stage::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: Stage,
    /// Overall progress of the task, 0..=100
    pub progress: u8,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<LookupResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ProgressEvent {
    pub fn stage(address: &str, status: Stage, progress: u8) -> Self {
        Self {
            status,
            progress,
            address: address.to_string(),
            data: None,
            error: None,
        }
    }

    pub fn done(address: &str, data: LookupResult, progress: u8) -> Self {
        Self {
            data: Some(data),
            ..Self::stage(address, Stage::Done, progress)
        }
    }

    pub fn failed(address: &str, error: ErrorBody, progress: u8) -> Self {
        Self {
            error: Some(error),
            ..Self::stage(address, Stage::Failed, progress)
        }
    }
}

/// Receiver of progress events, implemented by the surrounding transport.
///
/// `emit` must return promptly. Delivery failures are the sink's concern and
/// are never reported back.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, task_id: &str, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _task_id: &str, _event: ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, task_id: &str, event: ProgressEvent) {
        match (&event.status, &event.error) {
            (Stage::Failed, Some(error)) => {
                warn!("[{}] {} failed ({}%): {}", task_id, event.address, event.progress, error.message)
            }
            (Stage::Done, _) => info!("[{}] {} done ({}%)", task_id, event.address, event.progress),
            (status, _) => debug!("[{}] {} {} ({}%)", task_id, event.address, status, event.progress),
        }
    }
}

/// Forwards events over an unbounded channel so the core never waits on a
/// slow consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<(String, ProgressEvent)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, ProgressEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, task_id: &str, event: ProgressEvent) {
        if self.sender.send((task_id.to_string(), event)).is_err() {
            debug!("Progress receiver for task {} has gone away", task_id);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    completed: usize,
    errors: usize,
}

/// Completion counter for one task.
///
/// Every emission goes through the same lock as the counter, so a sink sees
/// the progress field in non-decreasing order even when lookups finish
/// concurrently.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    counts: Mutex<Counts>,
    start_time: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    pub percent: u8,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            counts: Mutex::new(Counts::default()),
            start_time: Instant::now(),
        }
    }

    fn percent_of(&self, completed: usize) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (completed.min(self.total) * 100 / self.total) as u8
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Runs `emit` with the current percentage while holding the counter.
    pub fn with_current<F: FnOnce(u8)>(&self, emit: F) {
        let counts = self.lock();
        emit(self.percent_of(counts.completed));
    }

    /// Counts one finished address and runs `emit` with the new percentage.
    pub fn record_completion<F: FnOnce(u8)>(&self, success: bool, emit: F) {
        let mut counts = self.lock();
        counts.completed += 1;
        if !success {
            counts.errors += 1;
        }
        emit(self.percent_of(counts.completed));
    }

    pub fn percent(&self) -> u8 {
        self.percent_of(self.lock().completed)
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let counts = *self.lock();
        ProgressInfo {
            total: self.total,
            completed: counts.completed,
            errors: counts.errors,
            success: counts.completed - counts.errors,
            elapsed: self.start_time.elapsed(),
            percent: self.percent_of(counts.completed),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().completed >= self.total
    }
}
