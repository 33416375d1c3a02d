//! Cross-process verification lock over the shared config/build directory.
//!
//! Tuning and auto-improvement both rewrite the same configuration file and
//! report artifacts, so only one run may touch them at a time — including
//! runs started from different terminals. The lock is a marker file created
//! with `create_new` (exclusive) semantics, holding the owner pid and
//! acquisition time as plain text.
//!
//! Recovery rules:
//! - A lock file older than `stale_after` belonged to a crashed holder and
//!   is reclaimed immediately instead of deadlocking every later waiter.
//! - Waiters poll at `poll_interval` and give up with
//!   [`LockError::Timeout`] after `timeout`.
//!
//! Reentrancy is explicit: the outer improvement loop acquires once and
//! threads its [`LockHandle`] into nested tuning calls, which then get a
//! no-op guard for the same path. No process-global state is involved, so
//! unrelated concurrent work in the same process cannot accidentally
//! inherit the lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for verification lock {path} after {waited_secs}s")]
    Timeout { path: PathBuf, waited_secs: u64 },

    #[error("verification lock io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Acquisition tuning. Defaults match the long-running evaluation workloads
/// this guards: waits up to 30 minutes, reclaims locks older than 4 hours.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            stale_after: Duration::from_secs(4 * 60 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Proof of holding the lock on a particular path. Cloneable so it can be
/// threaded through nested call contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    path: PathBuf,
}

/// Held lock. Dropping removes the marker file — but only when this guard
/// actually created it (reentrant guards never delete the outer holder's
/// file).
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owned: bool,
}

impl LockGuard {
    pub fn handle(&self) -> LockHandle {
        LockHandle {
            path: self.path.clone(),
        }
    }

    /// Whether this guard created the marker file (false for reentrant
    /// acquisitions).
    pub fn is_owner(&self) -> bool {
        self.owned
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Acquire the verification lock.
///
/// When `reentry` carries a handle for the same path the caller already
/// holds the lock further up the stack; acquisition is a no-op and the
/// returned guard releases nothing.
pub fn acquire(
    path: &Path,
    options: &LockOptions,
    reentry: Option<&LockHandle>,
) -> Result<LockGuard, LockError> {
    if let Some(handle) = reentry {
        if handle.path == path {
            return Ok(LockGuard {
                path: path.to_path_buf(),
                owned: false,
            });
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let started = Instant::now();
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let acquired_at = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let payload = format!("pid={} acquired_at={}\n", std::process::id(), acquired_at);
                // Payload is diagnostic only; a write failure must not leave
                // the lock file dangling without an owner record worth more
                // than an empty file, so it is ignored.
                let _ = file.write_all(payload.as_bytes());
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    owned: true,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(path, options.stale_after) {
                    // The holder crashed. Remove and retry without waiting;
                    // a NotFound race just means another waiter won the
                    // cleanup.
                    match std::fs::remove_file(path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(source) => {
                            return Err(LockError::Io {
                                path: path.to_path_buf(),
                                source,
                            })
                        }
                    }
                }
                if started.elapsed() >= options.timeout {
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                std::thread::sleep(options.poll_interval.max(Duration::from_millis(10)));
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn temp_lock(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edgetune_lock_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("verification_run.lock")
    }

    fn fast_options() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(300),
            stale_after: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let path = temp_lock("basic");
        {
            let guard = acquire(&path, &fast_options(), None).unwrap();
            assert!(guard.is_owner());
            assert!(path.exists());
            let content = std::fs::read_to_string(&path).unwrap();
            assert!(content.contains("pid="));
            assert!(content.contains("acquired_at="));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_times_out() {
        let path = temp_lock("contention");
        let _held = acquire(&path, &fast_options(), None).unwrap();
        match acquire(&path, &fast_options(), None) {
            Err(LockError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other.map(|g| g.is_owner())),
        }
        assert!(path.exists());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let path = temp_lock("threads");
        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicU32::new(0));
        let options = LockOptions {
            timeout: Duration::from_secs(10),
            ..fast_options()
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let in_section = Arc::clone(&in_section);
                let entries = Arc::clone(&entries);
                std::thread::spawn(move || {
                    let guard = acquire(&path, &options, None).unwrap();
                    assert!(
                        !in_section.swap(true, Ordering::SeqCst),
                        "two holders inside the critical section"
                    );
                    std::thread::sleep(Duration::from_millis(25));
                    in_section.store(false, Ordering::SeqCst);
                    entries.fetch_add(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 4);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_reclaimed_without_full_wait() {
        let path = temp_lock("stale");
        std::fs::write(&path, "pid=999999 acquired_at=0\n").unwrap();

        let options = LockOptions {
            timeout: Duration::from_secs(30),
            stale_after: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        std::thread::sleep(Duration::from_millis(80));

        let started = Instant::now();
        let guard = acquire(&path, &options, None).unwrap();
        assert!(guard.is_owner());
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "stale reclaim should not wait out the timeout"
        );
    }

    #[test]
    fn test_reentrant_acquire_is_noop() {
        let path = temp_lock("reentrant");
        let outer = acquire(&path, &fast_options(), None).unwrap();
        let inner = acquire(&path, &fast_options(), Some(&outer.handle())).unwrap();
        assert!(!inner.is_owner());
        drop(inner);
        // Outer still holds the lock.
        assert!(path.exists());
        drop(outer);
        assert!(!path.exists());
    }

    #[test]
    fn test_handle_for_other_path_does_not_reenter() {
        let path = temp_lock("cross_a");
        let other = temp_lock("cross_b");
        let held = acquire(&other, &fast_options(), None).unwrap();
        let guard = acquire(&path, &fast_options(), Some(&held.handle())).unwrap();
        assert!(guard.is_owner());
    }
}
