//! Host-facing log and progress sinks
//!
//! A pipeline stage reports human-readable progress to whatever workflow
//! runner embeds it. The runner supplies a [`Reporter`]; when it does not,
//! [`TracingReporter`] routes everything into `tracing`.

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output stream a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Log and progress sink provided by the host environment
pub trait Reporter: Send + Sync {
    /// Emit one log line on the given stream
    fn log(&self, message: &str, stream: LogStream);

    /// Report overall stage progress in percent (0-100)
    fn progress(&self, percent: f64);
}

/// Reporter that forwards to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn log(&self, message: &str, stream: LogStream) {
        match stream {
            LogStream::Stdout => info!("{}", message),
            LogStream::Stderr => warn!("{}", message),
        }
    }

    fn progress(&self, percent: f64) {
        debug!("progress: {:.1}%", percent);
    }
}

/// Shared default reporter
pub fn default_reporter() -> Arc<dyn Reporter> {
    Arc::new(TracingReporter)
}
