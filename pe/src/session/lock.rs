//! Store lock file with stale-lock recovery
//!
//! One exclusive lock guards the whole session store. The lock is a plain
//! file created with `create_new`, carrying `"<pid>\n<ISO8601>\n"` so a
//! contending process can decide whether the owner is still alive. Breaking
//! a lock is safe only because owners hold it for one in-memory
//! load-mutate-save cycle and never block on I/O (in particular, never on
//! oracle calls) while holding it.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::PrdError;

/// Poll interval while the lock is contended
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Total time to wait for the lock before failing with `LockTimeout`
pub const LOCK_WAIT_DEADLINE: Duration = Duration::from_secs(5);
/// A lock file older than this is considered abandoned
pub const LOCK_STALE_AGE: Duration = Duration::from_secs(30);

/// Lock paths currently held or being acquired by this process
///
/// Cooperative in-process guard on top of the cross-process lock file, so
/// threads of one process queue instead of fighting over `create_new`.
fn held_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn try_claim(path: &Path) -> bool {
    let mut held = held_paths().lock().unwrap_or_else(|e| e.into_inner());
    held.insert(path.to_path_buf())
}

fn release_claim(path: &Path) {
    let mut held = held_paths().lock().unwrap_or_else(|e| e.into_inner());
    held.remove(path);
}

/// Held exclusive lock on a session store; removed on drop
pub struct StoreLock {
    lock_path: PathBuf,
}

impl StoreLock {
    /// Acquire the exclusive store lock, recovering stale locks on the way
    ///
    /// Polls every [`LOCK_POLL_INTERVAL`] up to [`LOCK_WAIT_DEADLINE`]. A
    /// contended lock is broken when its file has vanished, is older than
    /// [`LOCK_STALE_AGE`], or names a pid that is no longer alive.
    pub fn acquire(store_path: &Path) -> Result<Self, PrdError> {
        Self::acquire_with_deadline(store_path, LOCK_WAIT_DEADLINE)
    }

    fn acquire_with_deadline(store_path: &Path, wait: Duration) -> Result<Self, PrdError> {
        let lock_path = lock_path_for(store_path);
        if let Some(dir) = lock_path.parent()
            && !dir.exists()
        {
            fs::create_dir_all(dir).map_err(|source| PrdError::LockDirCreateFailed {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let deadline = Instant::now() + wait;

        // In-process claim first, same deadline
        while !try_claim(&lock_path) {
            if Instant::now() >= deadline {
                return Err(PrdError::LockTimeout { path: lock_path });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    let stamp = chrono::Utc::now().to_rfc3339();
                    if let Err(e) = writeln!(file, "{}\n{}", std::process::id(), stamp) {
                        release_claim(&lock_path);
                        let _ = fs::remove_file(&lock_path);
                        return Err(PrdError::Io(e));
                    }
                    debug!(path = %lock_path.display(), "Acquired store lock");
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if should_break(&lock_path) {
                        warn!(path = %lock_path.display(), "Breaking stale store lock");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        release_claim(&lock_path);
                        return Err(PrdError::LockTimeout { path: lock_path });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    release_claim(&lock_path);
                    return Err(PrdError::Io(e));
                }
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        release_claim(&self.lock_path);
        debug!(path = %self.lock_path.display(), "Released store lock");
    }
}

/// Companion lock path for a store file
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Decide whether a contended lock file should be broken
fn should_break(lock_path: &Path) -> bool {
    let meta = match fs::metadata(lock_path) {
        Ok(m) => m,
        // Vanished between contention and stat: retry immediately
        Err(_) => return true,
    };

    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok());
    if let Some(age) = age
        && age > LOCK_STALE_AGE
    {
        debug!(path = %lock_path.display(), ?age, "Lock exceeds stale age");
        return true;
    }

    match owner_pid(lock_path) {
        Some(pid) if !pid_alive(pid) => {
            debug!(path = %lock_path.display(), pid, "Lock owner is not running");
            true
        }
        _ => false,
    }
}

/// First line of the lock file is the owner pid
fn owner_pid(lock_path: &Path) -> Option<i32> {
    let content = fs::read_to_string(lock_path).ok()?;
    content.lines().next()?.trim().parse().ok()
}

/// Liveness probe via a no-op signal
///
/// EPERM means the process exists under another owner, so it counts as alive.
#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    // No portable probe; rely on the stale-age rule
    true
}
