//! Advisory progress reporting for backup and restore sessions.
//!
//! One subscriber per session. The channel is bounded and emission never
//! blocks the worker: on overflow the report is dropped, since a newer
//! one is always on the way.

use serde::Serialize;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Scanning,
    Encrypting,
    Uploading,
    UpdatingCatalog,
    UploadingCatalog,
    Downloading,
    Extracting,
    Complete,
    Cancelled,
    Failed,
}

/// One progress report.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub phase: Phase,
    pub message: String,
    pub current_file: String,
    pub current_dir: String,
    pub total_files: u64,
    pub done_files: u64,
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub percent: f64,
}

impl Progress {
    pub fn phase(phase: Phase) -> Self {
        Progress {
            phase,
            message: String::new(),
            current_file: String::new(),
            current_dir: String::new(),
            total_files: 0,
            done_files: 0,
            total_bytes: 0,
            done_bytes: 0,
            percent: 0.0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Sending half handed to the session worker.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<Progress>>,
}

impl ProgressSink {
    /// A sink that discards every report.
    pub fn disabled() -> Self {
        ProgressSink { tx: None }
    }

    /// A connected sink plus the receiver the caller drains.
    pub fn channel() -> (Self, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (ProgressSink { tx: Some(tx) }, rx)
    }

    /// Deliver a report, best effort.
    pub fn emit(&self, progress: Progress) {
        if let Some(tx) = &self.tx {
            // Drop on overflow or on a hung subscriber.
            let _ = tx.try_send(progress);
        }
    }
}
