use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailferry::pipeline::{
    eml_file_name, message_identity, MessagePipeline, PipelineConfig, UploadOutcome,
};
use mailferry::state::{FolderCounter, MessageState, StateStore};
use mailferry::target::{ImapError, TargetMailbox};
use uuid::Uuid;

/// In-memory stand-in for the target server. `message_exists` models the
/// `SEARCH HEADER "Message-ID"` lookup, so it only answers for identities
/// that are real Message-IDs; the pipeline must never consult it for
/// MD5-derived keys.
#[derive(Default)]
struct FakeMailbox {
    folders: HashMap<String, HashSet<String>>,
    appends: usize,
    searches: usize,
    /// Fail this many APPENDs without storing anything.
    fail_appends: u32,
    /// Store the next APPEND but report a transport error, as if the
    /// response was lost on the wire.
    lose_next_append: bool,
    /// Answer every SEARCH with no hits.
    blind_search: bool,
    auth_broken: bool,
}

#[async_trait]
impl TargetMailbox for FakeMailbox {
    async fn message_exists(
        &mut self,
        server_folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError> {
        self.searches += 1;
        if self.auth_broken {
            return Err(ImapError::Auth("a001 NO LOGIN failed".to_string()));
        }
        if self.blind_search {
            return Ok(false);
        }
        Ok(self
            .folders
            .get(server_folder)
            .is_some_and(|ids| ids.contains(message_id)))
    }

    async fn append(&mut self, server_folder: &str, bytes: &[u8]) -> Result<(), ImapError> {
        self.appends += 1;
        if self.fail_appends > 0 {
            self.fail_appends -= 1;
            return Err(ImapError::Timeout("APPEND".to_string()));
        }

        let id = message_identity(bytes);
        self.folders
            .entry(server_folder.to_string())
            .or_default()
            .insert(id);

        if self.lose_next_append {
            self.lose_next_append = false;
            return Err(ImapError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "response lost",
            )));
        }
        Ok(())
    }
}

struct Fixture {
    root: PathBuf,
    store: Arc<StateStore>,
}

impl Fixture {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("mailferry-upload-it-{}", Uuid::new_v4()));
        std::fs::create_dir_all(root.join("messages/Inbox")).expect("create message tree");
        let store = StateStore::open(&root.join("stats")).expect("open store");
        Self {
            root,
            store: Arc::new(store),
        }
    }

    fn pipeline(&self, force: bool) -> MessagePipeline {
        MessagePipeline::new(
            self.store.clone(),
            PipelineConfig {
                max_retries: 3,
                retry_delay: Duration::from_millis(0),
                force,
            },
        )
    }

    fn write_message(&self, bytes: &[u8]) -> PathBuf {
        let key = message_identity(bytes);
        let path = self.root.join("messages/Inbox").join(eml_file_name(&key));
        std::fs::write(&path, bytes).expect("write message");
        path
    }

    fn counter(&self, name: &str) -> u64 {
        self.store.read_counter(name)
    }

    fn folder_counter(&self, counter: FolderCounter) -> u64 {
        self.store
            .read_counter(&StateStore::folder_counter_name("Inbox", counter))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn message_with_id(id: &str) -> Vec<u8> {
    format!(
        "Message-ID: <{id}>\r\n\
Content-Type: text/plain\r\n\
From: alice@example.com\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Subject: Fixture\r\n\
\r\n\
The quick brown fox jumps over the lazy dog, repeatedly and verbosely.\r\n"
    )
    .into_bytes()
}

fn message_without_id() -> Vec<u8> {
    b"Content-Type: text/plain\r\n\
From: bob@example.com\r\n\
Date: Mon, 1 Jan 2024 11:00:00 +0000\r\n\
Subject: Anonymous\r\n\
\r\n\
A message that never got a Message-ID header from its origin server.\r\n"
        .to_vec()
}

#[tokio::test]
async fn second_upload_is_deduplicated() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox::default();
    let pipeline = fixture.pipeline(false);
    let path = fixture.write_message(&message_with_id("abc@x"));

    let first = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("first upload");
    assert!(matches!(first, UploadOutcome::Committed { .. }));
    assert_eq!(mailbox.appends, 1);
    assert!(mailbox.folders["Inbox"].contains("abc@x"));

    let second = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("second upload");
    assert!(matches!(second, UploadOutcome::Skipped { .. }));
    // The state cache settles the decision; no further APPEND was issued.
    assert_eq!(mailbox.appends, 1);
    assert_eq!(mailbox.folders["Inbox"].len(), 1);

    assert_eq!(fixture.counter("total_messages"), 1);
    assert_eq!(fixture.counter("total_skipped"), 1);
    assert_eq!(fixture.folder_counter(FolderCounter::Count), 1);
    assert_eq!(fixture.folder_counter(FolderCounter::Skipped), 1);
    assert_eq!(fixture.counter("total_failed"), 0);
}

#[tokio::test]
async fn missing_message_id_falls_back_to_md5_and_still_dedups() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox::default();
    let pipeline = fixture.pipeline(false);

    let bytes = message_without_id();
    let expected_key = format!("{:x}", md5::compute(&bytes));
    let path = fixture.write_message(&bytes);

    let first = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("first upload");
    // An MD5 identity can never match a Message-ID header search, so the
    // APPEND commits without a server-side verification pass.
    assert!(matches!(first, UploadOutcome::Committed { .. }));
    assert_eq!(mailbox.appends, 1);
    assert_eq!(mailbox.searches, 0);
    assert!(mailbox.folders["Inbox"].contains(&expected_key));
    assert_eq!(
        fixture.store.get_message_state("Inbox", &expected_key),
        MessageState::Uploaded
    );

    // The second run settles through the state cache alone.
    let second = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("second upload");
    assert!(matches!(second, UploadOutcome::Skipped { .. }));
    assert_eq!(mailbox.appends, 1);
    assert_eq!(mailbox.searches, 0);
    assert_eq!(mailbox.folders["Inbox"].len(), 1);
    assert_eq!(
        fixture.store.get_message_state("Inbox", &expected_key),
        MessageState::Skipped
    );
}

#[tokio::test]
async fn lost_append_response_reconciles_on_retry() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox {
        lose_next_append: true,
        ..FakeMailbox::default()
    };
    let pipeline = fixture.pipeline(false);
    let path = fixture.write_message(&message_with_id("lost@x"));

    let outcome = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("upload");

    // The APPEND reached the server even though its response was lost; the
    // retry's dedup check must find it instead of appending again.
    assert!(matches!(outcome, UploadOutcome::Skipped { .. }));
    assert_eq!(mailbox.appends, 1);
    assert_eq!(mailbox.folders["Inbox"].len(), 1);
    assert_eq!(fixture.counter("total_failed"), 0);
}

#[tokio::test]
async fn transient_append_failures_consume_retries_then_succeed() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox {
        fail_appends: 2,
        ..FakeMailbox::default()
    };
    let pipeline = fixture.pipeline(false);
    let path = fixture.write_message(&message_with_id("retry@x"));

    let outcome = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("upload");
    assert!(matches!(outcome, UploadOutcome::Committed { .. }));
    assert_eq!(mailbox.appends, 3);
}

#[tokio::test]
async fn integrity_failure_is_recorded_without_touching_the_server() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox::default();
    let pipeline = fixture.pipeline(false);

    let path = fixture.root.join("messages/Inbox/short.eml");
    std::fs::write(&path, b"too small").expect("write runt");

    let outcome = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("upload");
    assert!(outcome.is_failed());
    assert_eq!(mailbox.appends, 0);
    assert_eq!(fixture.counter("total_failed"), 1);
    assert_eq!(fixture.folder_counter(FolderCounter::Failed), 1);
    assert_eq!(fixture.counter("total_messages"), 0);
}

#[tokio::test]
async fn verification_failure_fails_the_message_after_retries() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox {
        blind_search: true,
        ..FakeMailbox::default()
    };
    let pipeline = fixture.pipeline(false);
    let path = fixture.write_message(&message_with_id("unverified@x"));

    let outcome = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("upload");
    match outcome {
        UploadOutcome::Failed { reason, .. } => {
            assert!(reason.contains("verification"), "unexpected reason: {reason}")
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
    assert_eq!(mailbox.appends, 1);
    assert_eq!(fixture.counter("total_failed"), 1);
}

#[tokio::test]
async fn force_bypasses_cache_and_server_dedup() {
    let fixture = Fixture::new();
    let bytes = message_with_id("forced@x");
    let path = fixture.write_message(&bytes);

    let mut mailbox = FakeMailbox::default();
    mailbox
        .folders
        .entry("Inbox".to_string())
        .or_default()
        .insert("forced@x".to_string());
    fixture
        .store
        .put_message_state("Inbox", "forced@x", MessageState::Uploaded)
        .expect("seed cache");

    let outcome = fixture
        .pipeline(true)
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await
        .expect("upload");
    assert!(matches!(outcome, UploadOutcome::Committed { .. }));
    assert_eq!(mailbox.appends, 1);
}

#[tokio::test]
async fn auth_failure_aborts_instead_of_failing_the_message() {
    let fixture = Fixture::new();
    let mut mailbox = FakeMailbox {
        auth_broken: true,
        ..FakeMailbox::default()
    };
    let pipeline = fixture.pipeline(false);
    let path = fixture.write_message(&message_with_id("denied@x"));

    let result = pipeline
        .upload_message(&mut mailbox, "Inbox", "Inbox", &path)
        .await;
    assert!(matches!(result, Err(ImapError::Auth(_))));
    assert_eq!(fixture.counter("total_failed"), 0);
}
