use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use super::StateError;

pub const LOCK_POLL: Duration = Duration::from_millis(100);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Exclusive advisory lock backed by a file whose contents are the owner PID.
/// Acquisition is create-exclusive; a crashed owner leaves a reclaimable
/// artifact that the next acquirer removes once the PID is no longer live.
/// The lock is released when the handle drops.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    name: String,
}

impl LockFile {
    pub fn acquire(dir: &Path, name: &str, timeout: Duration) -> Result<Self, StateError> {
        let path = dir.join(format!("{name}.lock"));
        let deadline = Instant::now() + timeout;
        let pid = std::process::id();

        loop {
            match try_create(&path, pid) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        name: name.to_string(),
                    })
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if let Some(owner) = read_owner(&path) {
                        if !pid_is_live(owner) {
                            warn!(lock = name, owner, "reclaiming lock from dead owner");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                    } else {
                        // Unreadable or empty lock file: another acquirer is
                        // mid-write, or the artifact is corrupt. Poll.
                    }
                }
                Err(error) => return Err(StateError::Io(error)),
            }

            if Instant::now() >= deadline {
                return Err(StateError::LockTimeout {
                    name: name.to_string(),
                });
            }
            std::thread::sleep(LOCK_POLL);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path, pid: u32) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{pid}")?;
    Ok(())
}

fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

#[cfg(target_os = "linux")]
fn pid_is_live(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_live(_pid: u32) -> bool {
    // Without a portable liveness probe, never steal a lock.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_release_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock =
            LockFile::acquire(dir.path(), "counter_total", LOCK_TIMEOUT).expect("acquire lock");

        let path = dir.path().join("counter_total.lock");
        let contents = std::fs::read_to_string(&path).expect("read lock file");
        assert_eq!(contents, std::process::id().to_string());
        assert_eq!(lock.name(), "counter_total");

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn held_lock_times_out_second_acquirer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = LockFile::acquire(dir.path(), "busy", LOCK_TIMEOUT).expect("first acquire");

        let error = LockFile::acquire(dir.path(), "busy", Duration::from_millis(250))
            .expect_err("second acquire must time out");
        assert!(matches!(error, StateError::LockTimeout { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stale.lock");
        // PID 1 is live on every Linux system; u32::MAX - 1 never is.
        std::fs::write(&path, "4294967294").expect("plant stale lock");

        let lock =
            LockFile::acquire(dir.path(), "stale", Duration::from_millis(500)).expect("reclaim");
        let contents = std::fs::read_to_string(dir.path().join("stale.lock")).expect("read");
        assert_eq!(contents, std::process::id().to_string());
        drop(lock);
    }

    #[test]
    fn different_names_do_not_contend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _a = LockFile::acquire(dir.path(), "a", LOCK_TIMEOUT).expect("lock a");
        let _b = LockFile::acquire(dir.path(), "b", LOCK_TIMEOUT).expect("lock b");
    }
}
