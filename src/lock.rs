//! Single-instance runtime lock
//!
//! Two processes trading the same account is the one failure mode no amount
//! of in-process care can fix, so the lock is checked before anything else
//! touches the exchange. The lock file carries the owning pid; a lock whose
//! pid no longer resolves to a live process is stale and gets replaced.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another instance is running (pid={pid}); remove the lock file only if you are sure the process is dead: {path}"
    )]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk lock document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockPayload {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub command: String,
}

/// File-based process lock.
pub struct RuntimeLock {
    path: PathBuf,
    acquired: bool,
}

impl RuntimeLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquired: false,
        }
    }

    /// Probe whether `pid` belongs to a live process.
    ///
    /// ESRCH means the process is gone; EPERM means it exists but we may not
    /// signal it, which counts as alive.
    #[cfg(unix)]
    fn is_pid_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if ret == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// Without a signal probe there is no safe way to tell a stale lock from
    /// a live one; treat any recorded pid as alive.
    #[cfg(not(unix))]
    fn is_pid_alive(pid: u32) -> bool {
        pid != 0
    }

    fn read_payload(&self) -> Option<LockPayload> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Acquire the lock, or fail if another live instance holds it.
    pub fn acquire(&mut self) -> Result<(), LockError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let current_pid = std::process::id();
        if let Some(existing) = self.read_payload() {
            if existing.pid != 0 && existing.pid != current_pid && Self::is_pid_alive(existing.pid)
            {
                return Err(LockError::AlreadyRunning {
                    pid: existing.pid,
                    path: self.path.clone(),
                });
            }
        }

        let payload = LockPayload {
            pid: current_pid,
            started_at: Utc::now(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
        };
        let json = serde_json::to_string_pretty(&payload)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        self.acquired = true;
        info!(
            "runtime lock acquired: {} (pid={current_pid})",
            self.path.display()
        );
        Ok(())
    }

    /// Release the lock, deleting the file only when this process owns it.
    ///
    /// A lock recorded under another pid is never deleted: that instance may
    /// have legitimately replaced a lock we lost.
    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        self.acquired = false;

        match self.read_payload() {
            Some(payload) if payload.pid == std::process::id() => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!(
                        "failed to release runtime lock {}: {err}",
                        self.path.display()
                    );
                } else {
                    info!("runtime lock released: {}", self.path.display());
                }
            }
            Some(payload) => {
                warn!(
                    "runtime lock {} now owned by pid {}, leaving it in place",
                    self.path.display(),
                    payload.pid
                );
            }
            None => {}
        }
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Well beyond any real pid space, so the liveness probe reports gone.
    const DEAD_PID: u32 = 2_000_000_000;

    fn payload_json(pid: u32) -> String {
        serde_json::to_string(&LockPayload {
            pid,
            started_at: Utc::now(),
            command: "old".to_string(),
        })
        .expect("serialize")
    }

    #[test]
    fn acquire_then_release_removes_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.lock");

        let mut lock = RuntimeLock::new(&path);
        lock.acquire().expect("acquire");
        assert!(path.exists());

        let payload: LockPayload =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(payload.pid, std::process::id());

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.lock");
        std::fs::write(&path, payload_json(DEAD_PID)).expect("seed");

        let mut lock = RuntimeLock::new(&path);
        lock.acquire().expect("acquire over stale lock");

        let payload: LockPayload =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(payload.pid, std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn live_foreign_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.lock");
        // pid 1 always exists; the probe reports it alive (EPERM at worst).
        std::fs::write(&path, payload_json(1)).expect("seed");

        let mut lock = RuntimeLock::new(&path);
        match lock.acquire() {
            Err(LockError::AlreadyRunning { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn release_leaves_foreign_lock_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.lock");

        let mut lock = RuntimeLock::new(&path);
        lock.acquire().expect("acquire");

        // Another instance replaced the lock while we were running.
        std::fs::write(&path, payload_json(DEAD_PID)).expect("replace");
        lock.release();
        assert!(path.exists());
    }

    #[test]
    fn corrupt_lock_file_is_treated_as_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.lock");
        std::fs::write(&path, "not json").expect("seed");

        let mut lock = RuntimeLock::new(&path);
        lock.acquire().expect("acquire over corrupt lock");
        lock.release();
    }
}
