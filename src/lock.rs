//! Cross-process rebuild lock.
//!
//! The lock is a sentinel file created with `O_EXCL`; its JSON body names the
//! holder so a waiting process can report who it is waiting for. A sentinel
//! left by a dead process on this host is recovered.

use crate::config::LockSettings;
use crate::error::PipelineError;
use crate::process::{hostname, pid_alive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub hostname: String,
    /// What the holder is doing, e.g. `update-routing`.
    pub holder: String,
    pub acquired_at_ms: u64,
    /// Distinguishes holders within one process.
    pub token: u64,
}

impl LockHolder {
    fn current(holder: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            holder: holder.to_string(),
            acquired_at_ms: now.as_millis() as u64,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn is_alive(&self) -> bool {
        // Liveness cannot be checked across hosts.
        if self.hostname != hostname() {
            return true;
        }
        pid_alive(self.pid)
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {} on {}, since {} ms)", self.holder, self.pid, self.hostname, self.acquired_at_ms)
    }
}

pub struct RebuildLock {
    name: String,
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl RebuildLock {
    pub fn new(dir: &Path, name: &str, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{}.lock", name)),
            timeout,
            poll_interval,
        }
    }

    pub fn from_settings(settings: &LockSettings) -> Self {
        Self::new(&settings.dir, &settings.name, settings.timeout(), settings.poll_interval())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current holder, if any. Diagnostic only: the answer may be stale by
    /// the time the caller looks at it.
    pub fn holder(&self) -> Result<Option<LockHolder>, PipelineError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lock is free or the timeout elapses.
    pub fn acquire(&self, holder: &str) -> Result<LockGuard, PipelineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        let mut announced = false;
        loop {
            if let Some(guard) = self.try_acquire(holder)? {
                info!(lock = %self.name, waited_ms = started.elapsed().as_millis() as u64, "rebuild lock acquired");
                return Ok(guard);
            }
            let current = self.holder()?;
            if let Some(existing) = &current {
                if !existing.is_alive() {
                    warn!(lock = %self.name, holder = %existing, "recovering lock left by dead process");
                    self.remove_if_held_by(existing)?;
                    continue;
                }
            }
            if started.elapsed() >= self.timeout {
                return Err(PipelineError::LockTimeout {
                    lock: self.name.clone(),
                    waited: started.elapsed(),
                    holder: current,
                });
            }
            if !announced {
                match &current {
                    Some(h) => info!(lock = %self.name, holder = %h, "waiting for rebuild lock"),
                    None => info!(lock = %self.name, "waiting for rebuild lock"),
                }
                announced = true;
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn try_acquire(&self, holder: &str) -> Result<Option<LockGuard>, PipelineError> {
        let identity = LockHolder::current(holder);
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                let body = serde_json::to_string_pretty(&identity)?;
                if let Err(e) = file.write_all(body.as_bytes()).and_then(|_| file.sync_all()) {
                    let _ = fs::remove_file(&self.path);
                    return Err(e.into());
                }
                debug!(lock = %self.name, holder = %identity, "sentinel written");
                Ok(Some(LockGuard { path: self.path.clone(), identity }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stale sentinel. The file is first renamed to a name private
    /// to this call, so only one waiter claims it; if another waiter took the
    /// lock in between, its sentinel is linked back in place.
    fn remove_if_held_by(&self, expected: &LockHolder) -> Result<(), PipelineError> {
        let claimed = self.path.with_extension(format!(
            "stale.{}.{}",
            std::process::id(),
            NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
        ));
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let moved = fs::read_to_string(&claimed)
            .ok()
            .and_then(|text| serde_json::from_str::<LockHolder>(&text).ok());
        if moved.as_ref() != Some(expected) {
            match fs::hard_link(&claimed, &self.path) {
                Ok(()) => debug!(lock = %self.name, "sentinel changed hands, restored"),
                Err(e) => warn!(lock = %self.name, error = %e, "could not restore a live sentinel"),
            }
        }
        fs::remove_file(&claimed)?;
        Ok(())
    }
}

/// Releases the lock on drop, but only if the sentinel is still ours.
pub struct LockGuard {
    path: PathBuf,
    identity: LockHolder,
}

impl LockGuard {
    pub fn identity(&self) -> &LockHolder {
        &self.identity
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str::<LockHolder>(&text).ok())
            .is_some_and(|h| h == self.identity);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to release rebuild lock");
            } else {
                debug!(path = %self.path.display(), "rebuild lock released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(dir: &Path, timeout_ms: u64) -> RebuildLock {
        RebuildLock::new(dir, "routing_data", Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let lock = lock(dir.path(), 100);
        {
            let guard = lock.acquire("test").expect("acquire should succeed");
            assert_eq!(lock.holder().unwrap().as_ref(), Some(guard.identity()));
            assert!(lock.try_acquire("other").unwrap().is_none());
        }
        assert!(lock.holder().unwrap().is_none());
        assert!(lock.try_acquire("other").unwrap().is_some());
    }

    #[test]
    fn test_timeout_reports_holder() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let lock = lock(dir.path(), 50);
        let _guard = lock.acquire("update-routing").expect("acquire should succeed");
        match lock.acquire("refresh-map") {
            Err(PipelineError::LockTimeout { holder: Some(h), .. }) => {
                assert_eq!(h.holder, "update-routing");
                assert_eq!(h.pid, std::process::id());
            }
            other => panic!("expected lock timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dead_holder_is_recovered() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let lock = lock(dir.path(), 1000);
        let mut child = std::process::Command::new("true").spawn().expect("spawn should succeed");
        let dead_pid = child.id();
        child.wait().expect("wait should succeed");

        let mut stale = LockHolder::current("crashed");
        stale.pid = dead_pid;
        fs::write(lock.path(), serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = lock.acquire("update-routing").expect("stale lock should be recovered");
        assert_eq!(guard.identity().holder, "update-routing");
    }

    #[test]
    fn test_stale_removal_spares_a_sentinel_that_changed_hands() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let lock = lock(dir.path(), 100);
        let mut stale = LockHolder::current("crashed");
        stale.pid = u32::MAX;
        let live = lock.acquire("update-routing").expect("acquire should succeed");

        // The waiter saw `stale`, but a live holder replaced it meanwhile.
        lock.remove_if_held_by(&stale).expect("removal should succeed");
        assert_eq!(lock.holder().unwrap().as_ref(), Some(live.identity()));

        lock.remove_if_held_by(live.identity()).expect("removal should succeed");
        assert!(!lock.path().exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "claimed sentinels must not linger");
    }

    #[test]
    fn test_guard_does_not_remove_foreign_sentinel() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let lock = lock(dir.path(), 100);
        let guard = lock.acquire("first").expect("acquire should succeed");
        let mut other = guard.identity().clone();
        other.token = other.token.wrapping_add(1);
        fs::write(lock.path(), serde_json::to_string(&other).unwrap()).unwrap();
        drop(guard);
        assert_eq!(lock.holder().unwrap(), Some(other));
    }
}
