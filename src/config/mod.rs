use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const SYSTEM_CONFIG_FILE: &str = "system_config.yaml";
pub const ACCOUNTS_FILE: &str = "accounts.yaml";

const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Source folders that never contain user mail and are skipped with their
/// subtrees during the download walk.
const DEFAULT_EXCLUDED_FOLDERS: &[&str] = &[
    "Sync Issues",
    "Conflicts",
    "Local Failures",
    "Server Failures",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("permissions too open on {path} (mode {mode:o}, expected {expected:o})")]
    PermissionTooOpen {
        path: PathBuf,
        mode: u32,
        expected: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    pub data_dir: PathBuf,
    #[serde(default = "defaults::request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "defaults::retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "defaults::max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "defaults::max_parallel_uploads")]
    pub max_parallel_uploads: usize,
    #[serde(default = "defaults::excluded_folders")]
    pub excluded_folders: Vec<String>,
    #[serde(default = "defaults::graph_base_url")]
    pub graph_base_url: String,
    /// Override of the OAuth token endpoint, used by test setups.
    #[serde(default)]
    pub graph_token_url: Option<String>,
}

mod defaults {
    pub fn request_delay_ms() -> u64 {
        500
    }
    pub fn retry_delay_secs() -> u64 {
        5
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn http_timeout_secs() -> u64 {
        30
    }
    pub fn max_parallel_downloads() -> usize {
        3
    }
    pub fn max_parallel_uploads() -> usize {
        1
    }
    pub fn excluded_folders() -> Vec<String> {
        super::DEFAULT_EXCLUDED_FOLDERS
            .iter()
            .map(|name| name.to_string())
            .collect()
    }
    pub fn graph_base_url() -> String {
        super::DEFAULT_GRAPH_BASE.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetCredentials {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_imap_port() -> u16 {
    993
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderOverride {
    pub source: String,
    pub dest: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub email: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: SourceCredentials,
    pub target: TargetCredentials,
    #[serde(default)]
    pub folder_overrides: Vec<FolderOverride>,
    /// Per-account override of the global retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountsFile {
    accounts: Vec<Account>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub system: SystemConfig,
    pub accounts: Vec<Account>,
}

impl Config {
    /// Load both configuration files from `dir` without touching their
    /// permissions; permission enforcement is a separate step run by the
    /// verify stage and before any mutating stage.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let system_path = dir.join(SYSTEM_CONFIG_FILE);
        let accounts_path = dir.join(ACCOUNTS_FILE);

        let system: SystemConfig = read_yaml(&system_path)?;
        let accounts_file: AccountsFile = read_yaml(&accounts_path)?;

        if accounts_file.accounts.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no accounts defined in {}",
                accounts_path.display()
            )));
        }
        for account in &accounts_file.accounts {
            if account.email.trim().is_empty() {
                return Err(ConfigError::Invalid("account with empty email".to_string()));
            }
            if account.target.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account {}: empty target host",
                    account.email
                )));
            }
        }

        Ok(Self {
            config_dir: dir.to_path_buf(),
            system,
            accounts: accounts_file.accounts,
        })
    }

    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailferry").join("config"))
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|account| account.enabled)
    }

    pub fn retries_for(&self, account: &Account) -> u32 {
        account.max_retries.unwrap_or(self.system.max_retries)
    }

    /// Reject a config directory that is not 0700 or config files that are
    /// not 0600. Credentials live in these files; any group/other bit is a
    /// refusal, not a warning.
    pub fn check_permissions(dir: &Path) -> Result<(), ConfigError> {
        check_mode(dir, 0o700)?;
        check_mode(&dir.join(SYSTEM_CONFIG_FILE), 0o600)?;
        check_mode(&dir.join(ACCOUNTS_FILE), 0o600)?;
        Ok(())
    }
}

#[cfg(unix)]
fn check_mode(path: &Path, expected: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(ConfigError::PermissionTooOpen {
            path: path.to_path_buf(),
            mode,
            expected,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _expected: u32) -> Result<(), ConfigError> {
    Ok(())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Directory layout under the data root. `messages/` is a compatibility
/// contract with existing trees; everything else is internal.
#[derive(Debug, Clone)]
pub struct MigrationPaths {
    root: PathBuf,
}

impl MigrationPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.root.join("stats")
    }

    pub fn messages_dir(&self, account_email: &str) -> PathBuf {
        self.root.join("messages").join(account_email)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn migration_log(&self) -> PathBuf {
        self.logs_dir().join("migration.log")
    }

    pub fn stage_log(&self, stage: &str, account_email: &str) -> PathBuf {
        self.logs_dir()
            .join(stage)
            .join(format!("{account_email}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_configs(dir: &Path, system: &str, accounts: &str) {
        std::fs::create_dir_all(dir).expect("create config dir");
        std::fs::write(dir.join(SYSTEM_CONFIG_FILE), system).expect("write system config");
        std::fs::write(dir.join(ACCOUNTS_FILE), accounts).expect("write accounts config");
    }

    const MINIMAL_SYSTEM: &str = "data_dir: /tmp/mailferry-data\n";
    const MINIMAL_ACCOUNTS: &str = r#"
accounts:
  - email: user@example.com
    source:
      tenant_id: tenant-a
      client_id: client-a
      client_secret: secret-a
    target:
      host: imap.example.com
      username: user@example.com
      password: hunter2
"#;

    #[test]
    fn load_applies_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_configs(dir.path(), MINIMAL_SYSTEM, MINIMAL_ACCOUNTS);

        let config = Config::load(dir.path()).expect("load config");
        assert_eq!(config.system.request_delay_ms, 500);
        assert_eq!(config.system.max_parallel_downloads, 3);
        assert_eq!(config.system.max_parallel_uploads, 1);
        assert_eq!(config.system.graph_base_url, DEFAULT_GRAPH_BASE);
        assert!(config
            .system
            .excluded_folders
            .iter()
            .any(|name| name == "Sync Issues"));

        let account = &config.accounts[0];
        assert!(account.enabled);
        assert_eq!(account.target.port, 993);
        assert_eq!(config.retries_for(account), 3);
    }

    #[test]
    fn per_account_retry_override_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accounts = format!("{}    max_retries: 7\n", MINIMAL_ACCOUNTS);
        write_configs(dir.path(), MINIMAL_SYSTEM, &accounts);

        let config = Config::load(dir.path()).expect("load config");
        assert_eq!(config.retries_for(&config.accounts[0]), 7);
    }

    #[test]
    fn empty_accounts_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_configs(dir.path(), MINIMAL_SYSTEM, "accounts: []\n");

        let error = Config::load(dir.path()).expect_err("must reject empty accounts");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[cfg(unix)]
    #[test]
    fn loose_permissions_are_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        write_configs(dir.path(), MINIMAL_SYSTEM, MINIMAL_ACCOUNTS);

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .expect("chmod dir");
        for file in [SYSTEM_CONFIG_FILE, ACCOUNTS_FILE] {
            std::fs::set_permissions(
                dir.path().join(file),
                std::fs::Permissions::from_mode(0o600),
            )
            .expect("chmod file");
        }
        Config::check_permissions(dir.path()).expect("tight permissions pass");

        std::fs::set_permissions(
            dir.path().join(ACCOUNTS_FILE),
            std::fs::Permissions::from_mode(0o644),
        )
        .expect("chmod loose");
        let error = Config::check_permissions(dir.path()).expect_err("0644 must be rejected");
        assert!(matches!(error, ConfigError::PermissionTooOpen { .. }));
    }

    #[test]
    fn paths_follow_layout() {
        let paths = MigrationPaths::new(Path::new("/data"));
        assert_eq!(paths.stats_dir(), PathBuf::from("/data/stats"));
        assert_eq!(
            paths.messages_dir("user@example.com"),
            PathBuf::from("/data/messages/user@example.com")
        );
        assert_eq!(
            paths.stage_log("download", "user@example.com"),
            PathBuf::from("/data/logs/download/user@example.com.log")
        );
    }
}
