use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{Account, Config, ConfigError, MigrationPaths};
use crate::output::{self, OutputFormat, StatusSummary};
use crate::pipeline::{self, MessagePipeline, PipelineConfig, UploadOutcome};
use crate::scheduler::WorkerPool;
use crate::source::{ClientCredentialsProvider, GraphClient, SourceError, SourceMessage};
use crate::state::{FolderCounter, StateStore};
use crate::target::{ImapClient, ImapConfig, ImapError, ImapPool};
use crate::walker::{self, FolderOverrides};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_AUTH: i32 = 2;
pub const EXIT_PARTIAL: i32 = 3;
pub const EXIT_ABORTED: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Verify,
    Status,
    Download,
    Upload,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Verify => "verify",
            Stage::Status => "status",
            Stage::Download => "download",
            Stage::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageFlags {
    pub resume: bool,
    pub force: bool,
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl StageReport {
    pub fn merge(&mut self, other: StageReport) {
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source authentication: {0}")]
    SourceAuth(String),

    #[error("target authentication: {0}")]
    TargetAuth(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StageError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::Config(_) | StageError::Internal(_) => EXIT_CONFIG,
            StageError::SourceAuth(_) | StageError::TargetAuth(_) => EXIT_AUTH,
        }
    }
}

fn classify_source(error: SourceError) -> StageError {
    match error {
        SourceError::Auth(detail) => StageError::SourceAuth(detail),
        other => StageError::Internal(anyhow::Error::new(other)),
    }
}

fn classify_imap(error: ImapError) -> StageError {
    match error {
        ImapError::Auth(detail) => StageError::TargetAuth(detail),
        other => StageError::Internal(anyhow::Error::new(other)),
    }
}

/// Append-only human-readable log, one line per event, shared by the workers
/// of one stage.
struct StageLog {
    file: Mutex<std::fs::File>,
}

impl StageLog {
    fn open(path: &Path) -> Result<Self, StageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn line(&self, message: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{} {message}",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
    }
}

/// Outcome of one dispatched work unit.
enum UnitOutcome {
    Completed,
    Skipped,
    Failed,
    /// Abort the whole stage (authentication and similar).
    Fatal(StageError),
}

/// Binds the loaded configuration to one stage invocation and owns the stage
/// lifecycle: state store, logs, worker pools, summaries, exit codes.
pub struct Driver {
    config: Config,
    paths: MigrationPaths,
    flags: StageFlags,
    cancelled: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(config: Config, flags: StageFlags, cancelled: Arc<AtomicBool>) -> Self {
        let paths = MigrationPaths::new(&config.system.data_dir);
        Self {
            config,
            paths,
            flags,
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn request_delay(&self) -> Duration {
        Duration::from_millis(self.config.system.request_delay_ms)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.config.system.retry_delay_secs)
    }

    pub async fn run(&self, stage: Stage, json: bool) -> i32 {
        info!(stage = stage.name(), "stage starting");
        let outcome = match stage {
            Stage::Verify => self.verify().await,
            Stage::Status => self.status(json).await,
            Stage::Download => self.download().await,
            Stage::Upload => self.upload().await,
        };

        match outcome {
            Ok(report) => {
                if self.is_cancelled() {
                    eprintln!("{} aborted by user", stage.name());
                    EXIT_ABORTED
                } else if report.failed > 0 {
                    eprintln!(
                        "{} finished with failures: completed={} skipped={} failed={}",
                        stage.name(),
                        report.completed,
                        report.skipped,
                        report.failed
                    );
                    EXIT_PARTIAL
                } else {
                    EXIT_SUCCESS
                }
            }
            Err(StageError::Internal(error)) => {
                error!(stage = stage.name(), "stage failed: {error:#}");
                eprintln!("{} failed: {error:#}", stage.name());
                EXIT_CONFIG
            }
            Err(error) => {
                let code = error.exit_code();
                error!(stage = stage.name(), "stage failed: {error}");
                eprintln!("{} failed: {error}", stage.name());
                code
            }
        }
    }

    // ---- verify ----

    async fn verify(&self) -> Result<StageReport, StageError> {
        Config::check_permissions(&self.config.config_dir)?;
        println!("configuration permissions: ok");

        for account in self.config.enabled_accounts() {
            let graph = self.graph_client(account)?;
            graph.probe().await.map_err(classify_source)?;
            println!("{}: source API reachable", account.email);

            let mut imap = ImapClient::new(self.imap_config(account));
            imap.connect().await.map_err(classify_imap)?;
            imap.login().await.map_err(classify_imap)?;
            let _ = imap.logout().await;
            println!(
                "{}: target IMAP login ok ({})",
                account.email,
                account.target.host
            );
        }

        Ok(StageReport::default())
    }

    // ---- status ----

    async fn status(&self, json: bool) -> Result<StageReport, StageError> {
        let store = StateStore::open(&self.paths.stats_dir())
            .context("open state store")
            .map_err(StageError::Internal)?;

        let summary = StatusSummary {
            total_messages: store.read_counter("total_messages"),
            total_size: store.read_counter("total_size"),
            total_skipped: store.read_counter("total_skipped"),
            total_failed: store.read_counter("total_failed"),
            folders: store
                .list_folder_stats()
                .context("collect folder stats")
                .map_err(StageError::Internal)?,
        };

        let rendered = output::format_status(OutputFormat::from_json_flag(json), &summary)
            .map_err(StageError::Internal)?;
        println!("{rendered}");
        Ok(StageReport::default())
    }

    // ---- download ----

    async fn download(&self) -> Result<StageReport, StageError> {
        let store = self.open_store()?;
        let migration_log = Arc::new(StageLog::open(&self.paths.migration_log())?);
        let mut report = StageReport::default();

        for account in self.config.enabled_accounts() {
            if self.is_cancelled() {
                break;
            }
            migration_log.line(&format!("download start account={}", account.email));
            let account_report = self
                .download_account(account, store.clone(), &migration_log)
                .await?;
            migration_log.line(&format!(
                "download done account={} completed={} skipped={} failed={}",
                account.email,
                account_report.completed,
                account_report.skipped,
                account_report.failed
            ));
            report.merge(account_report);
        }

        Ok(report)
    }

    async fn download_account(
        &self,
        account: &Account,
        store: Arc<StateStore>,
        migration_log: &StageLog,
    ) -> Result<StageReport, StageError> {
        let log = Arc::new(StageLog::open(
            &self.paths.stage_log("download", &account.email),
        )?);
        let graph = Arc::new(self.graph_client(account)?);
        let overrides = FolderOverrides::new(&account.folder_overrides);
        let retries = self.config.retries_for(account);

        let folders = walker::walk_source_folders(
            graph.as_ref(),
            &overrides,
            &self.config.system.excluded_folders,
            self.request_delay(),
        )
        .await
        .map_err(classify_source)?;
        info!(
            account = %account.email,
            folders = folders.len(),
            "source folder walk complete"
        );

        let pool = WorkerPool::new(
            self.config.system.max_parallel_downloads,
            self.request_delay(),
            self.cancelled.clone(),
        );
        let account_dir = self.paths.messages_dir(&account.email);
        let mut report = StageReport::default();

        for folder in folders {
            if self.is_cancelled() {
                break;
            }

            store
                .start_folder_processing(&folder.local_path)
                .context("mark folder start")
                .map_err(StageError::Internal)?;
            let dir = account_dir.join(&folder.local_path);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create {}", dir.display()))
                .map_err(StageError::Internal)?;

            let messages = match graph.list_messages(&folder.id).await {
                Ok(messages) => messages,
                Err(error) if error.is_fatal() => return Err(classify_source(error)),
                Err(error) => {
                    warn!(folder = %folder.local_path, "message listing failed: {error}");
                    log.line(&format!("folder {} listing failed: {error}", folder.local_path));
                    report.failed += 1;
                    continue;
                }
            };
            log.line(&format!(
                "folder {} messages={}",
                folder.local_path,
                messages.len()
            ));

            let units: Vec<_> = messages
                .into_iter()
                .map(|message| {
                    let ctx = DownloadCtx {
                        graph: graph.clone(),
                        store: store.clone(),
                        log: log.clone(),
                        dir: dir.clone(),
                        folder_path: folder.local_path.clone(),
                        resume: self.flags.resume,
                        force: self.flags.force,
                        retries,
                    };
                    async move { download_one(ctx, message).await }
                })
                .collect();

            for outcome in pool.dispatch(units).await {
                match outcome {
                    UnitOutcome::Completed => report.completed += 1,
                    UnitOutcome::Skipped => report.skipped += 1,
                    UnitOutcome::Failed => report.failed += 1,
                    UnitOutcome::Fatal(error) => return Err(error),
                }
            }

            if !self.is_cancelled() {
                store
                    .complete_folder_processing(&folder.local_path)
                    .context("mark folder complete")
                    .map_err(StageError::Internal)?;
            }
        }

        migration_log.line(&format!("download walk account={} finished", account.email));
        println!(
            "download {}: completed={} skipped={} failed={}",
            account.email, report.completed, report.skipped, report.failed
        );
        Ok(report)
    }

    // ---- upload ----

    async fn upload(&self) -> Result<StageReport, StageError> {
        let store = self.open_store()?;
        let migration_log = Arc::new(StageLog::open(&self.paths.migration_log())?);
        let mut report = StageReport::default();

        for account in self.config.enabled_accounts() {
            if self.is_cancelled() {
                break;
            }
            migration_log.line(&format!("upload start account={}", account.email));
            let account_report = self.upload_account(account, store.clone()).await?;
            migration_log.line(&format!(
                "upload done account={} completed={} skipped={} failed={}",
                account.email,
                account_report.completed,
                account_report.skipped,
                account_report.failed
            ));
            report.merge(account_report);
        }

        Ok(report)
    }

    async fn upload_account(
        &self,
        account: &Account,
        store: Arc<StateStore>,
    ) -> Result<StageReport, StageError> {
        let log = Arc::new(StageLog::open(
            &self.paths.stage_log("upload", &account.email),
        )?);
        let parallelism = self.config.system.max_parallel_uploads;
        let sessions = Arc::new(ImapPool::new(self.imap_config(account), parallelism));
        let pool = WorkerPool::new(parallelism, self.request_delay(), self.cancelled.clone());
        let pipe = Arc::new(MessagePipeline::new(
            store.clone(),
            PipelineConfig {
                max_retries: self.config.retries_for(account),
                retry_delay: self.retry_delay(),
                force: self.flags.force,
            },
        ));

        let folders = walker::walk_local_folders(&self.paths.messages_dir(&account.email))
            .context("walk local message tree")
            .map_err(StageError::Internal)?;
        info!(
            account = %account.email,
            folders = folders.len(),
            "local folder walk complete"
        );

        let mut report = StageReport::default();
        for folder in folders {
            if self.is_cancelled() {
                break;
            }

            store
                .start_folder_processing(&folder.local_path)
                .context("mark folder start")
                .map_err(StageError::Internal)?;

            // Folder creation runs on a leased session before any message of
            // the folder is dispatched.
            let server_folder = {
                let mut client = sessions.lease().await;
                match client.create_folder(&folder.local_path).await {
                    Ok(()) => match client.server_path(&folder.local_path).await {
                        Ok(path) => path,
                        Err(error) if error.is_auth() => return Err(classify_imap(error)),
                        Err(error) => {
                            client.discard();
                            warn!(folder = %folder.local_path, "separator discovery failed: {error}");
                            log.line(&format!(
                                "folder {} separator discovery failed: {error}",
                                folder.local_path
                            ));
                            report.failed += folder.messages.len() as u64;
                            continue;
                        }
                    },
                    Err(error) if error.is_auth() => return Err(classify_imap(error)),
                    Err(error) => {
                        client.discard();
                        warn!(folder = %folder.local_path, "folder creation failed: {error}");
                        log.line(&format!(
                            "folder {} creation failed: {error}",
                            folder.local_path
                        ));
                        report.failed += folder.messages.len() as u64;
                        continue;
                    }
                }
            };

            let units: Vec<_> = folder
                .messages
                .iter()
                .map(|path| {
                    let sessions = sessions.clone();
                    let pipe = pipe.clone();
                    let log = log.clone();
                    let local = folder.local_path.clone();
                    let server = server_folder.clone();
                    let path = path.clone();
                    async move {
                        let mut client = sessions.lease().await;
                        match pipe
                            .upload_message(&mut *client, &local, &server, &path)
                            .await
                        {
                            Ok(UploadOutcome::Committed { size }) => {
                                log.line(&format!(
                                    "uploaded {}/{} bytes={size}",
                                    local,
                                    path.file_name().unwrap_or_default().to_string_lossy()
                                ));
                                UnitOutcome::Completed
                            }
                            Ok(UploadOutcome::Skipped { .. }) => {
                                log.line(&format!(
                                    "skipped {}/{} (duplicate)",
                                    local,
                                    path.file_name().unwrap_or_default().to_string_lossy()
                                ));
                                UnitOutcome::Skipped
                            }
                            Ok(UploadOutcome::Failed { key, reason }) => {
                                log.line(&format!("failed {local}/{key}: {reason}"));
                                UnitOutcome::Failed
                            }
                            Err(error) => {
                                client.discard();
                                UnitOutcome::Fatal(classify_imap(error))
                            }
                        }
                    }
                })
                .collect();

            for outcome in pool.dispatch(units).await {
                match outcome {
                    UnitOutcome::Completed => report.completed += 1,
                    UnitOutcome::Skipped => report.skipped += 1,
                    UnitOutcome::Failed => report.failed += 1,
                    UnitOutcome::Fatal(error) => return Err(error),
                }
            }

            if !self.is_cancelled() {
                store
                    .complete_folder_processing(&folder.local_path)
                    .context("mark folder complete")
                    .map_err(StageError::Internal)?;
            }
        }

        println!(
            "upload {}: completed={} skipped={} failed={}",
            account.email, report.completed, report.skipped, report.failed
        );
        Ok(report)
    }

    // ---- shared construction ----

    fn open_store(&self) -> Result<Arc<StateStore>, StageError> {
        let store = StateStore::open(&self.paths.stats_dir())
            .context("open state store")
            .map_err(StageError::Internal)?;
        if self.flags.reset {
            store
                .reset()
                .context("reset state store")
                .map_err(StageError::Internal)?;
            info!("state store reset");
        }
        Ok(Arc::new(store))
    }

    fn graph_client(&self, account: &Account) -> Result<GraphClient, StageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.system.http_timeout_secs))
            .build()
            .context("build http client")
            .map_err(StageError::Internal)?;

        let provider = ClientCredentialsProvider::new(
            http.clone(),
            &account.source.tenant_id,
            account.source.client_id.clone(),
            account.source.client_secret.clone(),
            self.config.system.graph_token_url.clone(),
        );

        Ok(GraphClient::new(
            http,
            self.config.system.graph_base_url.clone(),
            account.email.clone(),
            Arc::new(provider),
            self.config.retries_for(account),
            self.retry_delay(),
        ))
    }

    fn imap_config(&self, account: &Account) -> ImapConfig {
        ImapConfig {
            host: account.target.host.clone(),
            port: account.target.port,
            username: account.target.username.clone(),
            password: account.target.password.clone(),
            max_retries: self.config.retries_for(account),
            retry_delay: self.retry_delay(),
        }
    }
}

struct DownloadCtx {
    graph: Arc<GraphClient>,
    store: Arc<StateStore>,
    log: Arc<StageLog>,
    dir: PathBuf,
    folder_path: String,
    resume: bool,
    force: bool,
    retries: u32,
}

/// One download work unit: fetch raw MIME, store it atomically, commit
/// counters. A zero-byte or failed download leaves no partial file behind.
///
/// The file stem is the message identity key: the Message-ID when the
/// listing carried one, else the MD5 of the downloaded bytes. Without a
/// Message-ID the name is only known after the fetch, so the resume check
/// for those messages runs post-download.
async fn download_one(ctx: DownloadCtx, message: SourceMessage) -> UnitOutcome {
    let known_key = message
        .internet_message_id
        .as_deref()
        .map(pipeline::clean_message_id)
        .filter(|cleaned| !cleaned.is_empty());

    if let Some(key) = &known_key {
        let path = ctx.dir.join(pipeline::eml_file_name(key));
        if ctx.resume && !ctx.force && file_is_non_empty(&path) {
            return UnitOutcome::Skipped;
        }
    }

    match ctx.graph.download_message(&message.id).await {
        Ok(bytes) => {
            let key = known_key
                .unwrap_or_else(|| format!("{:x}", md5::compute(&bytes)));
            let file_name = pipeline::eml_file_name(&key);
            let path = ctx.dir.join(&file_name);
            if ctx.resume && !ctx.force && file_is_non_empty(&path) {
                return UnitOutcome::Skipped;
            }

            let tmp = ctx.dir.join(format!(".{file_name}.part"));
            let written = std::fs::write(&tmp, &bytes)
                .and_then(|_| std::fs::rename(&tmp, &path));
            if let Err(error) = written {
                let _ = std::fs::remove_file(&tmp);
                ctx.log.line(&format!(
                    "failed {}/{key}: store error: {error}",
                    ctx.folder_path
                ));
                record_download_failure(&ctx);
                return UnitOutcome::Failed;
            }

            let size = bytes.len() as u64;
            bump(&ctx, FolderCounter::Count, "total_messages", 1);
            bump(&ctx, FolderCounter::Size, "total_size", size);
            ctx.log
                .line(&format!("downloaded {}/{file_name} bytes={size}", ctx.folder_path));
            UnitOutcome::Completed
        }
        Err(error) if error.is_fatal() => UnitOutcome::Fatal(classify_source(error)),
        Err(error) => {
            // Remove a zero-byte artifact from an interrupted earlier run.
            if let Some(key) = &known_key {
                let path = ctx.dir.join(pipeline::eml_file_name(key));
                if let Ok(metadata) = std::fs::metadata(&path) {
                    if metadata.len() == 0 {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
            let label = known_key.as_deref().unwrap_or(&message.id);
            ctx.log
                .line(&format!("failed {}/{label}: {error}", ctx.folder_path));
            record_download_failure(&ctx);
            UnitOutcome::Failed
        }
    }
}

fn file_is_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|metadata| metadata.len() > 0)
}

fn record_download_failure(ctx: &DownloadCtx) {
    bump(ctx, FolderCounter::Failed, "total_failed", 1);
}

fn bump(ctx: &DownloadCtx, folder_counter: FolderCounter, total_counter: &str, delta: u64) {
    let folder_name = StateStore::folder_counter_name(&ctx.folder_path, folder_counter);
    for name in [folder_name.as_str(), total_counter] {
        if let Err(error) = ctx
            .store
            .increment_counter_retrying(name, delta, ctx.retries)
        {
            error!(counter = name, "counter increment failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_map_to_exit_codes() {
        let config = StageError::Config(ConfigError::Invalid("x".to_string()));
        assert_eq!(config.exit_code(), EXIT_CONFIG);

        let auth = StageError::SourceAuth("denied".to_string());
        assert_eq!(auth.exit_code(), EXIT_AUTH);
        let imap = StageError::TargetAuth("a001 NO LOGIN failed".to_string());
        assert_eq!(imap.exit_code(), EXIT_AUTH);

        let internal = StageError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(internal.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn classification_preserves_auth() {
        assert!(matches!(
            classify_source(SourceError::Auth("nope".to_string())),
            StageError::SourceAuth(_)
        ));
        assert!(matches!(
            classify_source(SourceError::NotFound("url".to_string())),
            StageError::Internal(_)
        ));
        assert!(matches!(
            classify_imap(ImapError::Auth("a001 NO".to_string())),
            StageError::TargetAuth(_)
        ));
    }

    #[test]
    fn reports_merge_counts() {
        let mut total = StageReport::default();
        total.merge(StageReport {
            completed: 2,
            skipped: 1,
            failed: 0,
        });
        total.merge(StageReport {
            completed: 1,
            skipped: 0,
            failed: 3,
        });
        assert_eq!(
            total,
            StageReport {
                completed: 3,
                skipped: 1,
                failed: 3,
            }
        );
    }

    #[test]
    fn stage_log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/download/user.log");
        let log = StageLog::open(&path).expect("open log");
        log.line("downloaded Inbox/abc.eml bytes=2048");
        log.line("second");

        let contents = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("downloaded Inbox/abc.eml bytes=2048"));
        assert!(lines[0].contains('T'));
    }
}
