//! Progress events and the sink they fan out to.
//!
//! Long-running subsystems (tap updates, downloads, installs) emit
//! [`ProgressEvent`]s through a single [`ProgressSink`] dispatcher. Consumers
//! implement the trait once and receive the full capability set; the library
//! never assumes a terminal. The CLI wires an indicatif-backed sink; library
//! callers default to [`NullSink`].

use std::sync::Arc;

/// Everything the core reports while working.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ResolveStarted {
        roots: Vec<String>,
    },
    ResolveCompleted {
        new: usize,
        already_installed: usize,
    },
    DownloadStarted {
        package: String,
        url: String,
    },
    DownloadProgress {
        package: String,
        bytes: u64,
        total: Option<u64>,
    },
    DownloadCompleted {
        package: String,
    },
    DownloadFailed {
        package: String,
        reason: String,
    },
    InstallStarted {
        package: String,
        version: String,
    },
    InstallCompleted {
        package: String,
        version: String,
    },
    InstallFailed {
        package: String,
        reason: String,
    },
    TapUpdateStarted {
        tap: String,
    },
    TapUpdateHeartbeat {
        tap: String,
        elapsed_secs: u64,
    },
    TapUpdateCompleted {
        tap: String,
    },
}

/// Single dispatcher all emitters share.
pub trait ProgressSink: Send + Sync {
    fn handle(&self, event: ProgressEvent);
}

/// Sink that discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn handle(&self, _event: ProgressEvent) {}
}

/// A shared no-op sink for callers that don't care about progress.
pub fn null_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullSink)
}

/// Per-package handle the downloader uses to report byte progress.
#[derive(Clone)]
pub struct DownloadProgressHandle {
    sink: Arc<dyn ProgressSink>,
    package: String,
}

impl DownloadProgressHandle {
    pub fn new(sink: Arc<dyn ProgressSink>, package: impl Into<String>) -> Self {
        DownloadProgressHandle {
            sink,
            package: package.into(),
        }
    }

    pub fn started(&self, url: &str) {
        self.sink.handle(ProgressEvent::DownloadStarted {
            package: self.package.clone(),
            url: url.to_string(),
        });
    }

    pub fn update(&self, bytes: u64, total: Option<u64>) {
        self.sink.handle(ProgressEvent::DownloadProgress {
            package: self.package.clone(),
            bytes,
            total,
        });
    }

    pub fn completed(&self) {
        self.sink.handle(ProgressEvent::DownloadCompleted {
            package: self.package.clone(),
        });
    }

    pub fn failed(&self, reason: &str) {
        self.sink.handle(ProgressEvent::DownloadFailed {
            package: self.package.clone(),
            reason: reason.to_string(),
        });
    }
}
