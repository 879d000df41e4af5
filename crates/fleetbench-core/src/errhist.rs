//! Append-only error history, snapshotted at phase boundaries and on HTTP
//! replies. Services include it in prepare/start/interrupt responses so the
//! master can relay worker diagnostics to the user.

use std::sync::Mutex;

/// Shared buffer of diagnostic lines. One per process (master or service);
/// workers hold it via `Arc` and record their own failures.
#[derive(Debug, Default)]
pub struct ErrorHistory {
    buf: Mutex<String>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one diagnostic line. Also emits it through tracing so the line
    /// shows up in the service log even when the master never fetches it.
    pub fn record(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::error!("{}", line);
        let mut buf = self.buf.lock().unwrap();
        buf.push_str(line);
        buf.push('\n');
    }

    /// Current contents without clearing (HTTP reply snapshot).
    pub fn snapshot(&self) -> String {
        self.buf.lock().unwrap().clone()
    }

    /// Take and clear the contents (phase-boundary drain).
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buf.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_snapshot_take() {
        let hist = ErrorHistory::new();
        assert!(hist.is_empty());

        hist.record("worker 0: boom");
        hist.record("worker 1: bang");

        let snap = hist.snapshot();
        assert!(snap.contains("worker 0: boom\n"));
        assert!(snap.contains("worker 1: bang\n"));
        assert!(!hist.is_empty());

        let taken = hist.take();
        assert_eq!(taken, snap);
        assert!(hist.is_empty());
        assert_eq!(hist.take(), "");
    }
}
