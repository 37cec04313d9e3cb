use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

use super::protocol::{self, ImapResponse, ResponseStatus};
use super::ImapError;

/// Per IMAP command round-trip.
pub const IMAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Dovecot convention, used when the server reports no delimiter.
const DEFAULT_SEPARATOR: char = '.';

const BACKOFF_CAP: Duration = Duration::from_secs(32);

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Greeted,
    Authenticated,
    Selected(String),
    LoggedOut,
}

struct Framed {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
}

/// One command's untagged responses plus its tagged completion.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub untagged: Vec<ImapResponse>,
    pub tag: String,
    pub status: ResponseStatus,
    pub text: String,
}

impl CommandReply {
    pub fn tagged_line(&self) -> String {
        format!("{} {} {}", self.tag, self.status, self.text)
    }
}

/// IMAP session over TLS. One instance is one connection; a failed session is
/// discarded (never reused) and reconnects lazily through `ensure_ready`.
pub struct ImapClient {
    config: ImapConfig,
    stream: Option<Framed>,
    state: SessionState,
    tag_counter: u32,
    separator: Option<char>,
}

impl ImapClient {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            stream: None,
            state: SessionState::Disconnected,
            tag_counter: 0,
            separator: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Open the TLS connection and read the greeting. TLS 1.2 minimum and
    /// hostname verification come from the rustls client defaults.
    pub async fn connect(&mut self) -> Result<(), ImapError> {
        if self.stream.is_some() {
            return Err(ImapError::State("already connected".to_string()));
        }

        let address = format!("{}:{}", self.config.host, self.config.port);
        let tcp = timeout(IMAP_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| ImapError::Timeout(format!("connect {address}")))??;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|error| ImapError::Tls(format!("invalid hostname: {error}")))?;

        let tls = timeout(IMAP_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ImapError::Timeout(format!("tls handshake {address}")))?
            .map_err(|error| ImapError::Tls(error.to_string()))?;

        let (read_half, write_half) = tokio::io::split(tls);
        self.stream = Some(Framed {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        let greeting = self.read_line("greeting").await?;
        if !greeting.starts_with("* OK") {
            self.discard();
            return Err(ImapError::Greeting(greeting));
        }

        debug!(host = %self.config.host, "imap session greeted");
        self.state = SessionState::Greeted;
        Ok(())
    }

    pub async fn login(&mut self) -> Result<(), ImapError> {
        if self.state != SessionState::Greeted {
            return Err(ImapError::State(format!(
                "login from {:?}",
                self.state_name()
            )));
        }

        let command = protocol::format_login(&self.config.username, &self.config.password);
        let reply = self.command_named(&command, "LOGIN").await?;
        if !reply.status.is_ok() {
            self.discard();
            return Err(ImapError::Auth(reply.tagged_line()));
        }
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Connect and authenticate unless this session is already usable.
    pub async fn ensure_ready(&mut self) -> Result<(), ImapError> {
        if self.stream.is_some()
            && matches!(
                self.state,
                SessionState::Authenticated | SessionState::Selected(_)
            )
        {
            return Ok(());
        }
        self.discard();
        self.connect().await?;
        self.login().await
    }

    /// Drop a failed or finished session. The separator memo survives: it is
    /// a property of the server, not of one connection.
    pub fn discard(&mut self) {
        self.stream = None;
        self.state = SessionState::Disconnected;
    }

    pub async fn logout(&mut self) -> Result<(), ImapError> {
        if self.stream.is_some() {
            // Best effort: the session ends either way.
            let _ = self.command_named("LOGOUT", "LOGOUT").await;
        }
        self.stream = None;
        self.state = SessionState::LoggedOut;
        Ok(())
    }

    /// Hierarchy delimiter from `LIST "" ""`, memoized. Defaults to `.` when
    /// the server reports none.
    pub async fn separator(&mut self) -> Result<char, ImapError> {
        if let Some(sep) = self.separator {
            return Ok(sep);
        }

        self.ensure_ready().await?;
        let reply = self
            .command_named(&protocol::format_list("", ""), "LIST")
            .await?;
        let sep = reply
            .untagged
            .iter()
            .find_map(|response| match response {
                ImapResponse::UntaggedList { delimiter, .. } => *delimiter,
                _ => None,
            })
            .unwrap_or(DEFAULT_SEPARATOR);
        self.separator = Some(sep);
        Ok(sep)
    }

    /// Translate a slash-separated logical path into the server's hierarchy.
    pub async fn server_path(&mut self, logical: &str) -> Result<String, ImapError> {
        let sep = self.separator().await?;
        Ok(logical.replace('/', &sep.to_string()))
    }

    pub async fn list_folders(&mut self) -> Result<BTreeSet<String>, ImapError> {
        self.ensure_ready().await?;
        let reply = self
            .command_named(&protocol::format_list("", "*"), "LIST")
            .await?;
        if !reply.status.is_ok() {
            return Err(ImapError::Server {
                command: "LIST".to_string(),
                reply: reply.tagged_line(),
            });
        }
        Ok(protocol::list_names(&reply.untagged).into_iter().collect())
    }

    /// Create a folder (and its ancestors) from a slash-separated logical
    /// path. `NO [ALREADYEXISTS]` and a confirming LIST echo both count as
    /// success; other failures retry with backoff.
    pub async fn create_folder(&mut self, logical: &str) -> Result<(), ImapError> {
        for ancestor in ancestor_paths(logical) {
            let server = self.server_path(&ancestor).await?;
            self.create_one(&server).await?;
        }
        Ok(())
    }

    async fn create_one(&mut self, server_path: &str) -> Result<(), ImapError> {
        let mut last: Option<ImapError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.config.retry_delay, attempt)).await;
            }

            if let Err(error) = self.ensure_ready().await {
                if error.is_transient() && attempt < self.config.max_retries {
                    warn!(folder = server_path, attempt, "reconnect before CREATE failed: {error}");
                    last = Some(error);
                    continue;
                }
                return Err(error);
            }

            let reply = match self
                .command_named(&protocol::format_create(server_path), "CREATE")
                .await
            {
                Ok(reply) => reply,
                Err(error) => {
                    if error.is_transient() && attempt < self.config.max_retries {
                        warn!(folder = server_path, attempt, "CREATE failed: {error}");
                        last = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            };

            if reply.status.is_ok() || reply.text.to_ascii_uppercase().contains("ALREADYEXISTS") {
                return Ok(());
            }

            // Some servers refuse CREATE but list the folder anyway.
            if let Ok(list) = self
                .command_named(&protocol::format_list("", server_path), "LIST")
                .await
            {
                if protocol::list_names(&list.untagged)
                    .iter()
                    .any(|name| name == server_path)
                {
                    return Ok(());
                }
            }

            warn!(folder = server_path, attempt, reply = %reply.tagged_line(), "CREATE refused");
            last = Some(ImapError::Server {
                command: "CREATE".to_string(),
                reply: reply.tagged_line(),
            });
        }

        Err(last.unwrap_or_else(|| ImapError::Server {
            command: "CREATE".to_string(),
            reply: format!("{server_path}: retries exhausted"),
        }))
    }

    pub async fn select(&mut self, server_folder: &str) -> Result<(), ImapError> {
        self.ensure_ready().await?;
        let reply = self
            .command_named(&protocol::format_select(server_folder), "SELECT")
            .await?;
        if !reply.status.is_ok() {
            return Err(ImapError::Server {
                command: "SELECT".to_string(),
                reply: reply.tagged_line(),
            });
        }
        self.state = SessionState::Selected(server_folder.to_string());
        Ok(())
    }

    /// `SELECT` then `SEARCH HEADER "Message-ID"`. The select is issued every
    /// call: a pooled session must start each command sequence from a known
    /// mailbox.
    pub async fn message_exists(
        &mut self,
        server_folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError> {
        self.select(server_folder).await?;
        let reply = self
            .command_named(&protocol::format_search_message_id(message_id), "SEARCH")
            .await?;
        if !reply.status.is_ok() {
            return Err(ImapError::Server {
                command: "SEARCH".to_string(),
                reply: reply.tagged_line(),
            });
        }
        Ok(protocol::search_hit(&reply.untagged))
    }

    /// Single APPEND attempt with literal framing; the caller owns the retry
    /// loop so dedup can be re-checked between attempts.
    pub async fn append(&mut self, server_folder: &str, bytes: &[u8]) -> Result<(), ImapError> {
        self.ensure_ready().await?;

        let tag = self.next_tag();
        let command = protocol::format_append(server_folder, bytes.len());
        self.write_all(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let mut wrote_literal = false;
        loop {
            let line = self.read_line("APPEND").await?;
            match protocol::parse_line(&line) {
                ImapResponse::Continuation(_) => {
                    if wrote_literal {
                        self.discard();
                        return Err(ImapError::Parse(
                            "second continuation during APPEND".to_string(),
                        ));
                    }
                    self.write_all(bytes).await?;
                    self.write_all(b"\r\n").await?;
                    wrote_literal = true;
                }
                ImapResponse::Tagged {
                    tag: reply_tag,
                    status,
                    text,
                } if reply_tag == tag => {
                    if status.is_ok() {
                        return Ok(());
                    }
                    return Err(ImapError::Server {
                        command: "APPEND".to_string(),
                        reply: format!("{reply_tag} {status} {text}"),
                    });
                }
                _ => {
                    // Untagged noise (EXISTS updates etc).
                }
            }
        }
    }

    async fn command_named(&mut self, command: &str, name: &str) -> Result<CommandReply, ImapError> {
        if self.stream.is_none() {
            return Err(ImapError::State(format!("{name} without connection")));
        }

        let tag = self.next_tag();
        self.write_all(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_line(name).await?;
            match protocol::parse_line(&line) {
                ImapResponse::Tagged {
                    tag: reply_tag,
                    status,
                    text,
                } if reply_tag == tag => {
                    return Ok(CommandReply {
                        untagged,
                        tag: reply_tag,
                        status,
                        text,
                    });
                }
                ImapResponse::Continuation(text) => {
                    self.discard();
                    return Err(ImapError::Parse(format!(
                        "unexpected continuation during {name}: {text}"
                    )));
                }
                response => untagged.push(response),
            }
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("a{:03}", self.tag_counter)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ImapError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ImapError::State("write without connection".to_string()))?;
        let result = timeout(IMAP_TIMEOUT, async {
            stream.writer.write_all(bytes).await?;
            stream.writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                self.discard();
                Err(ImapError::Io(error))
            }
            Err(_) => {
                self.discard();
                Err(ImapError::Timeout("write".to_string()))
            }
        }
    }

    async fn read_line(&mut self, operation: &str) -> Result<String, ImapError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ImapError::State("read without connection".to_string()))?;

        let mut line = String::new();
        let result = timeout(IMAP_TIMEOUT, stream.reader.read_line(&mut line)).await;
        match result {
            Ok(Ok(0)) => {
                self.discard();
                Err(ImapError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed during {operation}"),
                )))
            }
            Ok(Ok(_)) => Ok(line),
            Ok(Err(error)) => {
                self.discard();
                Err(ImapError::Io(error))
            }
            Err(_) => {
                self.discard();
                Err(ImapError::Timeout(operation.to_string()))
            }
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            SessionState::Disconnected => "disconnected",
            SessionState::Greeted => "greeted",
            SessionState::Authenticated => "authenticated",
            SessionState::Selected(_) => "selected",
            SessionState::LoggedOut => "logged out",
        }
    }
}

/// `"A/B/C"` → `["A", "A/B", "A/B/C"]`.
fn ancestor_paths(logical: &str) -> Vec<String> {
    let segments: Vec<&str> = logical.split('/').filter(|s| !s.is_empty()).collect();
    (1..=segments.len())
        .map(|depth| segments[..depth].join("/"))
        .collect()
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(4);
    (base * factor).min(BACKOFF_CAP)
}
