//! Audit log: admission denials and admin mutations.
//!
//! Events are newline-delimited plain text, appended to the configured
//! file and mirrored into a bounded in-memory ring so the admin endpoint
//! can tail recent entries without touching the filesystem.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::warn;

const RING_CAPACITY: usize = 1000;

struct Inner {
    file: Option<File>,
    recent: VecDeque<String>,
}

/// Append-only audit sink; cloneable via Arc at the call sites.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                file: None,
                recent: VecDeque::with_capacity(RING_CAPACITY),
            }),
        }
    }

    /// Also append to `path`; a file that cannot be opened degrades to
    /// in-memory logging with a warning.
    pub fn with_file<P: AsRef<Path>>(path: P) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref());
        let file = match file {
            Ok(f) => Some(f),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "audit log file unavailable");
                None
            }
        };
        Self {
            inner: Mutex::new(Inner {
                file,
                recent: VecDeque::with_capacity(RING_CAPACITY),
            }),
        }
    }

    /// Record one event.
    pub fn record(&self, event: &str) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let line = format!("{ts} {event}");

        let mut inner = self.inner.lock();
        if inner.recent.len() >= RING_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(line.clone());
        if let Some(file) = inner.file.as_mut() {
            if writeln!(file, "{line}").is_err() {
                // Drop the handle rather than failing every request.
                inner.file = None;
            }
        }
    }

    /// Last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .recent
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_tail() {
        let log = AuditLog::new();
        log.record("deny ip=10.0.0.1 reason=rate");
        log.record("admin backend_remove id=1.2.3.4:80");
        let tail = log.tail(10);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].contains("deny ip=10.0.0.1"));
        assert!(tail[1].contains("backend_remove"));
    }

    #[test]
    fn test_tail_limit() {
        let log = AuditLog::new();
        for i in 0..20 {
            log.record(&format!("event {i}"));
        }
        let tail = log.tail(5);
        assert_eq!(tail.len(), 5);
        assert!(tail[4].contains("event 19"));
        assert!(tail[0].contains("event 15"));
    }

    #[test]
    fn test_ring_bounded() {
        let log = AuditLog::new();
        for i in 0..(RING_CAPACITY + 50) {
            log.record(&format!("e{i}"));
        }
        assert_eq!(log.tail(usize::MAX).len(), RING_CAPACITY);
    }

    #[test]
    fn test_file_append() {
        let dir = std::env::temp_dir().join("trellis-audit-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(format!("audit-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let log = AuditLog::with_file(&path);
        log.record("persisted event");
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("persisted event"));
        let _ = std::fs::remove_file(&path);
    }
}
