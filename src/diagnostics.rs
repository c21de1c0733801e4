/// Diagnostics sink injected into components that report errors or events.
///
/// Components never log on their own: they receive an `Arc<dyn Diagnostics>`
/// and report through it. [`LogDiagnostics`] forwards to the `log` facade and
/// is what binaries install; tests can swap in a recorder.

use crate::error::Error;
use std::sync::Arc;

pub trait Diagnostics: Send + Sync {
    fn info(&self, component: &str, message: &str);

    fn error(&self, component: &str, error: &Error);

    fn client_connected(&self, peer: &str) {
        self.info("server", &format!("client {} connected", peer));
    }

    /// `error` is `None` for a clean close.
    fn client_disconnected(&self, peer: &str, error: Option<&Error>) {
        match error {
            Some(err) if !err.is_disconnect() => self.error("server", err),
            _ => self.info("server", &format!("client {} disconnected", peer)),
        }
    }
}

/// Forwards to the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn info(&self, component: &str, message: &str) {
        log::info!(target: "reactive_tables", "[{}] {}", component, message);
    }

    fn error(&self, component: &str, error: &Error) {
        log::error!(target: "reactive_tables", "[{}] {}", component, error);
    }
}

pub fn log_diagnostics() -> Arc<dyn Diagnostics> {
    Arc::new(LogDiagnostics)
}

/// Keeps every reported line in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingDiagnostics {
    pub lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingDiagnostics {
    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().filter(|l| l.starts_with("error")).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl Diagnostics for RecordingDiagnostics {
    fn info(&self, component: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("info [{}] {}", component, message));
        }
    }

    fn error(&self, component: &str, error: &Error) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("error [{}] {}", component, error));
        }
    }
}
