use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

pub mod lock;

pub use lock::{LockFile, LOCK_POLL, LOCK_TIMEOUT};

const FOLDERS_DIR: &str = "folders";
const MESSAGE_CACHE_DIR: &str = "message_cache";
const JOBS_DIR: &str = "jobs";
const PROCESSED_DIR: &str = "processed";
const LOCKS_DIR: &str = "locks";

/// Marker prefix distinguishing a folder whose processing started from one
/// that completed; the completed marker is a bare timestamp.
const PROCESSING_PREFIX: &str = "start:";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock timeout on '{name}'")]
    LockTimeout { name: String },

    #[error("corrupt state record {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

/// Per-message upload state, retained across runs until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Uploaded,
    Skipped,
    Failed,
    Unknown,
}

impl MessageState {
    /// States that settle the dedup decision without touching the server.
    pub fn is_settled(self) -> bool {
        matches!(self, MessageState::Uploaded | MessageState::Skipped)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageState::Uploaded => "uploaded",
            MessageState::Skipped => "skipped",
            MessageState::Failed => "failed",
            MessageState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MessageState {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "uploaded" => Ok(MessageState::Uploaded),
            "skipped" => Ok(MessageState::Skipped),
            "failed" => Ok(MessageState::Failed),
            "unknown" => Ok(MessageState::Unknown),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Start,
    Uploading,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Start => "start",
            JobPhase::Uploading => "uploading",
            JobPhase::Completed => "completed",
            JobPhase::Skipped => "skipped",
            JobPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

impl FromStr for JobPhase {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "start" => Ok(JobPhase::Start),
            "uploading" => Ok(JobPhase::Uploading),
            "completed" => Ok(JobPhase::Completed),
            "skipped" => Ok(JobPhase::Skipped),
            "failed" => Ok(JobPhase::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub message: String,
    pub timestamp: i64,
}

/// Per-folder counter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderCounter {
    Count,
    Size,
    Skipped,
    Failed,
}

impl FolderCounter {
    fn file_name(self) -> &'static str {
        match self {
            FolderCounter::Count => "count",
            FolderCounter::Size => "size",
            FolderCounter::Skipped => "skipped",
            FolderCounter::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FolderStats {
    pub path: String,
    pub count: u64,
    pub size: u64,
    pub skipped: u64,
    pub failed: u64,
    pub processed: bool,
}

/// Durable key/value and counter store over the local filesystem.
///
/// Every mutable record is written via temp-file + rename under an advisory
/// lock keyed to the record; reads never lock. A stale read of the message
/// cache is acceptable because the server-side search is the second line of
/// defense for dedup.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn open(stats_dir: &Path) -> Result<Self, StateError> {
        let store = Self {
            root: stats_dir.to_path_buf(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    fn ensure_layout(&self) -> Result<(), StateError> {
        for dir in [
            FOLDERS_DIR,
            MESSAGE_CACHE_DIR,
            JOBS_DIR,
            PROCESSED_DIR,
            LOCKS_DIR,
        ] {
            std::fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockFile, StateError> {
        LockFile::acquire(&self.locks_dir(), &sanitize(name), timeout)
    }

    // ---- counters ----

    /// Atomically add `delta` to the named counter and return the new value.
    /// Counter names may contain `/` (per-folder counters live under
    /// `folders/<path>/`).
    pub fn increment_counter(&self, name: &str, delta: u64) -> Result<u64, StateError> {
        let _lock = self.acquire_lock(&format!("counter_{name}"), LOCK_TIMEOUT)?;
        let path = self.root.join(name);
        let current = read_integer(&path)?;
        let next = current.saturating_add(delta);
        write_atomic(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// `increment_counter` with lock timeouts retried up to `attempts` extra
    /// times; other errors surface immediately.
    pub fn increment_counter_retrying(
        &self,
        name: &str,
        delta: u64,
        attempts: u32,
    ) -> Result<u64, StateError> {
        let mut last = StateError::LockTimeout {
            name: name.to_string(),
        };
        for _ in 0..=attempts {
            match self.increment_counter(name, delta) {
                Ok(value) => return Ok(value),
                Err(error @ StateError::LockTimeout { .. }) => last = error,
                Err(error) => return Err(error),
            }
        }
        Err(last)
    }

    /// Current counter value; 0 when the counter was never written.
    pub fn read_counter(&self, name: &str) -> u64 {
        read_integer(&self.root.join(name)).unwrap_or(0)
    }

    pub fn folder_counter_name(folder_path: &str, counter: FolderCounter) -> String {
        format!("{FOLDERS_DIR}/{folder_path}/{}", counter.file_name())
    }

    // ---- message state cache ----

    fn message_state_path(&self, folder_path: &str, key: &str) -> PathBuf {
        self.root
            .join(MESSAGE_CACHE_DIR)
            .join(format!("{}_{}", sanitize(folder_path), sanitize(key)))
    }

    pub fn put_message_state(
        &self,
        folder_path: &str,
        key: &str,
        state: MessageState,
    ) -> Result<(), StateError> {
        let record = format!("{state}:{}", Utc::now().timestamp());
        let path = self.message_state_path(folder_path, key);
        let _lock = self.acquire_lock(
            &format!("msg_{}_{}", sanitize(folder_path), sanitize(key)),
            LOCK_TIMEOUT,
        )?;
        write_atomic(&path, record.as_bytes())
    }

    /// Lock-free read; unparseable or missing records read as `Unknown`.
    pub fn get_message_state(&self, folder_path: &str, key: &str) -> MessageState {
        let path = self.message_state_path(folder_path, key);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return MessageState::Unknown;
        };
        raw.split(':')
            .next()
            .and_then(|state| state.parse().ok())
            .unwrap_or(MessageState::Unknown)
    }

    // ---- job status ----

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root
            .join(JOBS_DIR)
            .join(format!("job_{}", sanitize(job_id)))
    }

    pub fn mark_job_status(
        &self,
        job_id: &str,
        phase: JobPhase,
        message: &str,
    ) -> Result<(), StateError> {
        let record = format!("{phase}:{message}:{}", Utc::now().timestamp());
        let _lock = self.acquire_lock(&format!("job_{job_id}"), LOCK_TIMEOUT)?;
        write_atomic(&self.job_path(job_id), record.as_bytes())
    }

    pub fn read_job_status(&self, job_id: &str) -> Result<Option<JobStatus>, StateError> {
        let path = self.job_path(job_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StateError::Io(error)),
        };

        // "<phase>:<message>:<timestamp>" with a free-form message: the phase
        // is everything before the first colon, the timestamp everything
        // after the last.
        let corrupt = |detail: &str| StateError::Corrupt {
            path: path.clone(),
            detail: detail.to_string(),
        };
        let (phase_raw, rest) = raw.split_once(':').ok_or_else(|| corrupt("no phase"))?;
        let (message, ts_raw) = rest.rsplit_once(':').ok_or_else(|| corrupt("no timestamp"))?;
        let phase = phase_raw
            .parse()
            .map_err(|_| corrupt(&format!("unknown phase '{phase_raw}'")))?;
        let timestamp = ts_raw
            .trim()
            .parse()
            .map_err(|_| corrupt(&format!("bad timestamp '{ts_raw}'")))?;

        Ok(Some(JobStatus {
            phase,
            message: message.to_string(),
            timestamp,
        }))
    }

    // ---- folder processing markers ----

    fn processed_path(&self, folder_path: &str) -> PathBuf {
        self.root.join(PROCESSED_DIR).join(sanitize(folder_path))
    }

    pub fn start_folder_processing(&self, folder_path: &str) -> Result<(), StateError> {
        let record = format!("{PROCESSING_PREFIX}{}", Utc::now().timestamp());
        write_atomic(&self.processed_path(folder_path), record.as_bytes())
    }

    pub fn complete_folder_processing(&self, folder_path: &str) -> Result<(), StateError> {
        self.mark_folder_processed(folder_path)
    }

    pub fn mark_folder_processed(&self, folder_path: &str) -> Result<(), StateError> {
        let record = Utc::now().timestamp().to_string();
        write_atomic(&self.processed_path(folder_path), record.as_bytes())
    }

    pub fn is_folder_processed(&self, folder_path: &str) -> bool {
        match std::fs::read_to_string(self.processed_path(folder_path)) {
            Ok(raw) => !raw.starts_with(PROCESSING_PREFIX),
            Err(_) => false,
        }
    }

    pub fn is_folder_being_processed(&self, folder_path: &str) -> bool {
        match std::fs::read_to_string(self.processed_path(folder_path)) {
            Ok(raw) => raw.starts_with(PROCESSING_PREFIX),
            Err(_) => false,
        }
    }

    // ---- summaries ----

    /// Collect per-folder counters for the status stage. Folders appear in
    /// path order.
    pub fn list_folder_stats(&self) -> Result<Vec<FolderStats>, StateError> {
        let mut stats = Vec::new();
        let base = self.root.join(FOLDERS_DIR);
        collect_folder_stats(&base, &base, self, &mut stats)?;
        stats.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(stats)
    }

    /// Remove all state, counters, caches, and locks. Idempotent; only called
    /// by the driver when no stage is active.
    pub fn reset(&self) -> Result<(), StateError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(StateError::Io(error)),
        }
        self.ensure_layout()
    }
}

fn collect_folder_stats(
    base: &Path,
    dir: &Path,
    store: &StateStore,
    out: &mut Vec<FolderStats>,
) -> Result<(), StateError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(StateError::Io(error)),
    };

    let mut has_counters = false;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_folder_stats(base, &path, store, out)?;
        } else {
            has_counters = true;
        }
    }

    if has_counters && dir != base {
        let rel = dir
            .strip_prefix(base)
            .map_err(|_| StateError::Corrupt {
                path: dir.to_path_buf(),
                detail: "folder stats outside folders dir".to_string(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let counter =
            |kind: FolderCounter| store.read_counter(&StateStore::folder_counter_name(&rel, kind));
        out.push(FolderStats {
            count: counter(FolderCounter::Count),
            size: counter(FolderCounter::Size),
            skipped: counter(FolderCounter::Skipped),
            failed: counter(FolderCounter::Failed),
            processed: store.is_folder_processed(&rel),
            path: rel,
        });
    }
    Ok(())
}

/// Replace anything outside `[A-Za-z0-9.@_-]` with `_` so record keys become
/// flat file names.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '@' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn read_integer(path: &Path) -> Result<u64, StateError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| StateError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("not an integer: '{}'", raw.trim()),
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(StateError::Io(error)),
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().ok_or_else(|| StateError::Corrupt {
        path: path.to_path_buf(),
        detail: "record path has no parent".to_string(),
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
