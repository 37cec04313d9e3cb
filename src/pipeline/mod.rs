use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::state::{FolderCounter, JobPhase, MessageState, StateError, StateStore};
use crate::target::{ImapError, TargetMailbox};

/// Integrity floor: anything smaller cannot be a real RFC 822 message.
pub const MIN_MESSAGE_SIZE: usize = 100;

const REQUIRED_HEADERS: [&str; 4] = ["Content-Type", "From", "Date", "Subject"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("message too small: {size} bytes")]
    TooSmall { size: usize },

    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("multipart message lacks closing boundary --{boundary}--")]
    MissingClosingBoundary { boundary: String },
}

/// Value of a header in the message's header block, unfolded, or `None` when
/// absent. Lookup is case-insensitive and stops at the first blank line.
pub fn header_value(bytes: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut value: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            if let Some(current) = value.as_mut() {
                current.push(' ');
                current.push_str(line.trim());
            }
            continue;
        }
        if value.is_some() {
            // Finished the matched header before the blank line.
            break;
        }

        if let Some((header, rest)) = line.split_once(':') {
            if header.trim().eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_string());
            }
        }
    }

    value
}

fn has_header(bytes: &[u8], name: &str) -> bool {
    header_value(bytes, name).is_some()
}

/// Strip angle brackets, CR, and LF from a raw `Message-ID` value.
pub fn clean_message_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '<' | '>' | '\r' | '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// The message identity key: the `Message-ID` header with angle brackets,
/// CR, and LF stripped; when absent or empty, the lowercase hex MD5 of the
/// raw bytes.
pub fn message_identity(bytes: &[u8]) -> String {
    if let Some(raw) = header_value(bytes, "Message-ID") {
        let cleaned = clean_message_id(&raw);
        if !cleaned.is_empty() {
            return cleaned;
        }
    }
    format!("{:x}", md5::compute(bytes))
}

/// File name for a stored message, derived from its identity key.
pub fn eml_file_name(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '@' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("{stem}.eml")
}

pub fn check_integrity(bytes: &[u8]) -> Result<(), IntegrityError> {
    if bytes.len() < MIN_MESSAGE_SIZE {
        return Err(IntegrityError::TooSmall { size: bytes.len() });
    }

    for header in REQUIRED_HEADERS {
        if !has_header(bytes, header) {
            return Err(IntegrityError::MissingHeader(header));
        }
    }

    let content_type = header_value(bytes, "Content-Type").unwrap_or_default();
    if content_type.to_ascii_lowercase().contains("multipart") {
        if let Some(boundary) = boundary_parameter(&content_type) {
            let closing = format!("--{boundary}--");
            if !String::from_utf8_lossy(bytes).contains(&closing) {
                return Err(IntegrityError::MissingClosingBoundary { boundary });
            }
        }
    }

    Ok(())
}

fn boundary_parameter(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let rest = &content_type[start..];
    let value = rest.split(';').next().unwrap_or(rest).trim();
    let value = value.trim_matches('"').trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Committed { size: u64 },
    Skipped { size: u64 },
    Failed { key: String, reason: String },
}

impl UploadOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, UploadOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Bypass both the state cache and the server-side dedup search.
    pub force: bool,
}

/// Per-message orchestration for the upload stage: identity, integrity,
/// dedup, APPEND, verification, and the state/counter commits on every
/// terminal transition.
pub struct MessagePipeline {
    store: Arc<StateStore>,
    config: PipelineConfig,
}

impl MessagePipeline {
    pub fn new(store: Arc<StateStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Drive one message through the upload state machine. `Err` is reserved
    /// for conditions that abort the whole stage (authentication); every
    /// per-message failure becomes `UploadOutcome::Failed`.
    pub async fn upload_message<T: TargetMailbox>(
        &self,
        client: &mut T,
        local_folder: &str,
        server_folder: &str,
        path: &Path,
    ) -> Result<UploadOutcome, ImapError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) => {
                let key = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unreadable".to_string());
                return Ok(self.commit_failed(
                    local_folder,
                    &key,
                    &new_job_id(),
                    &format!("read {}: {error}", path.display()),
                ));
            }
        };

        // A server-side SEARCH can only ever match a real Message-ID header;
        // MD5-derived identities are dedupable through the state cache alone.
        let message_id = header_value(&bytes, "Message-ID")
            .map(|raw| clean_message_id(&raw))
            .filter(|cleaned| !cleaned.is_empty());
        let key = message_id
            .clone()
            .unwrap_or_else(|| format!("{:x}", md5::compute(&bytes)));
        let size = bytes.len() as u64;
        let job_id = new_job_id();
        self.mark_job(&job_id, JobPhase::Start, &format!("{local_folder}/{key}"));

        if !self.config.force && self.store.get_message_state(local_folder, &key).is_settled() {
            debug!(folder = local_folder, key, "state cache hit, skipping");
            return Ok(self.commit_skipped(local_folder, &key, &job_id, size));
        }

        if let Err(error) = check_integrity(&bytes) {
            return Ok(self.commit_failed(local_folder, &key, &job_id, &error.to_string()));
        }

        let mut last_reply = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                sleep(self.config.retry_delay).await;
            }

            // Dedup check runs on every attempt: a prior APPEND may have
            // succeeded at the server while its response was lost.
            if !self.config.force && message_id.is_some() {
                match client.message_exists(server_folder, &key).await {
                    Ok(true) => {
                        debug!(folder = local_folder, key, "server already has message");
                        return Ok(self.commit_skipped(local_folder, &key, &job_id, size));
                    }
                    Ok(false) => {}
                    Err(error) if error.is_auth() => return Err(error),
                    Err(error) => {
                        warn!(folder = local_folder, key, attempt, "dedup check failed: {error}");
                        last_reply = error.to_string();
                        continue;
                    }
                }
            }

            self.mark_job(&job_id, JobPhase::Uploading, &format!("{local_folder}/{key}"));
            match client.append(server_folder, &bytes).await {
                Ok(()) => {
                    if message_id.is_none() {
                        return Ok(self.commit_uploaded(local_folder, &key, &job_id, size));
                    }
                    return self
                        .verify_upload(client, local_folder, server_folder, &key, &job_id, size)
                        .await;
                }
                Err(error) if error.is_auth() => return Err(error),
                Err(error @ ImapError::Parse(_)) => {
                    return Ok(self.commit_failed(
                        local_folder,
                        &key,
                        &job_id,
                        &format!("append: {error}"),
                    ));
                }
                Err(error) => {
                    warn!(folder = local_folder, key, attempt, "append failed: {error}");
                    last_reply = error.to_string();
                }
            }
        }

        Ok(self.commit_failed(
            local_folder,
            &key,
            &job_id,
            &format!("append retries exhausted: {last_reply}"),
        ))
    }

    /// Post-APPEND verification: the message must be findable by its
    /// Message-ID within the retry budget.
    async fn verify_upload<T: TargetMailbox>(
        &self,
        client: &mut T,
        local_folder: &str,
        server_folder: &str,
        key: &str,
        job_id: &str,
        size: u64,
    ) -> Result<UploadOutcome, ImapError> {
        let mut last = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                sleep(self.config.retry_delay).await;
            }
            match client.message_exists(server_folder, key).await {
                Ok(true) => return Ok(self.commit_uploaded(local_folder, key, job_id, size)),
                Ok(false) => last = "no search hit".to_string(),
                Err(error) if error.is_auth() => return Err(error),
                Err(error) => {
                    warn!(folder = local_folder, key, attempt, "verify search failed: {error}");
                    last = error.to_string();
                }
            }
        }
        Ok(self.commit_failed(
            local_folder,
            key,
            job_id,
            &format!("verification failed: {last}"),
        ))
    }

    fn commit_uploaded(
        &self,
        folder: &str,
        key: &str,
        job_id: &str,
        size: u64,
    ) -> UploadOutcome {
        self.put_state(folder, key, MessageState::Uploaded);
        self.mark_job(job_id, JobPhase::Completed, &format!("{folder}/{key}"));
        self.bump(&StateStore::folder_counter_name(folder, FolderCounter::Count), 1);
        self.bump(&StateStore::folder_counter_name(folder, FolderCounter::Size), size);
        self.bump("total_messages", 1);
        self.bump("total_size", size);
        UploadOutcome::Committed { size }
    }

    fn commit_skipped(&self, folder: &str, key: &str, job_id: &str, size: u64) -> UploadOutcome {
        self.put_state(folder, key, MessageState::Skipped);
        self.mark_job(job_id, JobPhase::Skipped, &format!("{folder}/{key}"));
        self.bump(
            &StateStore::folder_counter_name(folder, FolderCounter::Skipped),
            1,
        );
        self.bump(&StateStore::folder_counter_name(folder, FolderCounter::Size), size);
        self.bump("total_skipped", 1);
        self.bump("total_size", size);
        UploadOutcome::Skipped { size }
    }

    fn commit_failed(&self, folder: &str, key: &str, job_id: &str, reason: &str) -> UploadOutcome {
        error!(folder, key, "message failed: {reason}");
        self.put_state(folder, key, MessageState::Failed);
        self.mark_job(job_id, JobPhase::Failed, &format!("{folder}/{key}: {reason}"));
        self.bump(
            &StateStore::folder_counter_name(folder, FolderCounter::Failed),
            1,
        );
        self.bump("total_failed", 1);
        UploadOutcome::Failed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    fn put_state(&self, folder: &str, key: &str, state: MessageState) {
        if let Err(error) = self.retry_locks(|| self.store.put_message_state(folder, key, state)) {
            error!(folder, key, "state cache write failed: {error}");
        }
    }

    fn mark_job(&self, job_id: &str, phase: JobPhase, message: &str) {
        if let Err(error) = self.retry_locks(|| self.store.mark_job_status(job_id, phase, message)) {
            error!(job_id, "job status write failed: {error}");
        }
    }

    fn bump(&self, counter: &str, delta: u64) {
        if delta == 0 {
            return;
        }
        if let Err(error) = self.retry_locks(|| self.store.increment_counter(counter, delta).map(|_| ()))
        {
            error!(counter, "counter increment failed: {error}");
        }
    }

    /// Lock timeouts are retried up to the configured budget; other state
    /// errors surface immediately.
    fn retry_locks<F>(&self, mut op: F) -> Result<(), StateError>
    where
        F: FnMut() -> Result<(), StateError>,
    {
        let mut last = None;
        for _ in 0..=self.config.max_retries {
            match op() {
                Ok(()) => return Ok(()),
                Err(StateError::LockTimeout { name }) => {
                    last = Some(StateError::LockTimeout { name });
                }
                Err(error) => return Err(error),
            }
        }
        Err(last.unwrap_or(StateError::LockTimeout {
            name: "unknown".to_string(),
        }))
    }
}

fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Message-ID: <abc@x>\r\n\
Content-Type: text/plain\r\n\
From: alice@example.com\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Subject: Hello\r\n\
\r\n\
Body body body body body body body body body body body.\r\n";

    #[test]
    fn identity_prefers_message_id_header() {
        assert_eq!(message_identity(SIMPLE), "abc@x");
    }

    #[test]
    fn identity_unfolds_and_strips_brackets() {
        let folded = b"Message-ID:\r\n <long-id@example.com>\r\nFrom: a@b\r\n\r\nbody";
        assert_eq!(message_identity(folded), "long-id@example.com");
    }

    #[test]
    fn identity_falls_back_to_md5() {
        let body = b"From: a@b\r\nSubject: no id\r\n\r\nbody";
        let key = message_identity(body);
        assert_eq!(key, format!("{:x}", md5::compute(body)));
        assert_eq!(key.len(), 32);
        // Deterministic across calls.
        assert_eq!(key, message_identity(body));
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_stops_at_body() {
        assert_eq!(
            header_value(SIMPLE, "subject").as_deref(),
            Some("Hello")
        );
        let with_body_header = b"From: a@b\r\n\r\nSubject: not a header\r\n";
        assert_eq!(header_value(with_body_header, "Subject"), None);
    }

    #[test]
    fn eml_file_name_sanitizes_key() {
        assert_eq!(eml_file_name("abc@x"), "abc@x.eml");
        assert_eq!(eml_file_name("a/b:c d"), "a_b_c_d.eml");
    }

    #[test]
    fn integrity_accepts_complete_message() {
        assert_eq!(check_integrity(SIMPLE), Ok(()));
    }

    #[test]
    fn integrity_rejects_small_messages() {
        assert_eq!(
            check_integrity(b"tiny"),
            Err(IntegrityError::TooSmall { size: 4 })
        );
    }

    #[test]
    fn integrity_requires_each_header() {
        let missing_date = b"Message-ID: <x@y>\r\n\
Content-Type: text/plain\r\n\
From: alice@example.com\r\n\
Subject: Hello\r\n\
\r\n\
Body body body body body body body body body body body body.\r\n";
        assert_eq!(
            check_integrity(missing_date),
            Err(IntegrityError::MissingHeader("Date"))
        );
    }

    #[test]
    fn integrity_requires_closing_boundary_for_multipart() {
        let open = b"Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
From: a@b\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Subject: Parts\r\n\
\r\n\
--xyz\r\nContent-Type: text/plain\r\n\r\npart one\r\n";
        assert_eq!(
            check_integrity(open),
            Err(IntegrityError::MissingClosingBoundary {
                boundary: "xyz".to_string()
            })
        );

        let closed = b"Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
From: a@b\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Subject: Parts\r\n\
\r\n\
--xyz\r\nContent-Type: text/plain\r\n\r\npart one\r\n--xyz--\r\n";
        assert_eq!(check_integrity(closed), Ok(()));
    }

    #[test]
    fn boundary_parameter_handles_quoting_and_parameters() {
        assert_eq!(
            boundary_parameter("multipart/mixed; boundary=\"abc\"; charset=utf-8"),
            Some("abc".to_string())
        );
        assert_eq!(
            boundary_parameter("multipart/alternative; BOUNDARY=plain"),
            Some("plain".to_string())
        );
        assert_eq!(boundary_parameter("text/plain"), None);
    }
}
