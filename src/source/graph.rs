use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{SourceError, TokenProvider};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Server maximum for `$top`.
const PAGE_SIZE: usize = 999;
const TOKEN_SKEW_SECONDS: i64 = 60;
/// Explicit throttling marker in Graph response bodies; classification does
/// not rely on the status code alone.
const THROTTLE_MARKER: &str = "ApplicationThrottled";
const ERROR_BODY_MAX_LEN: usize = 200;

const FOLDER_SELECT_FIELDS: &str = "id,displayName,parentFolderId,childFolderCount";
const MESSAGE_SELECT_FIELDS: &str = "id,internetMessageId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFolder {
    pub id: String,
    pub display_name: String,
    pub child_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub id: String,
    pub internet_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphFolder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "childFolderCount")]
    child_folder_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FolderPage {
    value: Vec<GraphFolder>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessageRef {
    id: String,
    #[serde(rename = "internetMessageId")]
    internet_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagePage {
    value: Vec<GraphMessageRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Source mail client over the Graph REST API. Rate pacing between requests
/// is the scheduler's job; this client only handles per-request retry.
pub struct GraphClient {
    http: Client,
    base_url: String,
    mailbox: String,
    tokens: Arc<dyn TokenProvider>,
    max_retries: u32,
    retry_delay: Duration,
}

impl GraphClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        mailbox: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            mailbox: mailbox.into(),
            tokens,
            max_retries,
            retry_delay,
        }
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Reachability and authorization probe for the verify stage.
    pub async fn probe(&self) -> Result<(), SourceError> {
        let url = self.folders_url(None, 1)?;
        self.get_with_retry(url.as_str(), false).await.map(|_| ())
    }

    pub async fn list_root_folders(&self) -> Result<Vec<SourceFolder>, SourceError> {
        self.list_folders(None).await
    }

    pub async fn list_child_folders(
        &self,
        parent_id: &str,
    ) -> Result<Vec<SourceFolder>, SourceError> {
        self.list_folders(Some(parent_id)).await
    }

    async fn list_folders(&self, parent_id: Option<&str>) -> Result<Vec<SourceFolder>, SourceError> {
        let mut url = self.folders_url(parent_id, PAGE_SIZE)?.to_string();
        let mut folders = Vec::new();

        loop {
            let body = self.get_with_retry(&url, false).await?;
            let page: FolderPage = serde_json::from_slice(&body)?;
            for folder in page.value {
                folders.push(SourceFolder {
                    id: folder.id,
                    display_name: folder.display_name,
                    child_count: folder.child_folder_count.unwrap_or(0),
                });
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(folders)
    }

    pub async fn list_messages(&self, folder_id: &str) -> Result<Vec<SourceMessage>, SourceError> {
        let endpoint = format!(
            "{}/users/{}/mailFolders/{}/messages",
            self.base_url, self.mailbox, folder_id
        );
        let mut url = Url::parse(&endpoint)
            .map_err(|error| SourceError::Transport(format!("parse url {endpoint}: {error}")))?;
        url.query_pairs_mut()
            .append_pair("$top", &PAGE_SIZE.to_string())
            .append_pair("$select", MESSAGE_SELECT_FIELDS);
        let mut url = url.to_string();
        let mut messages = Vec::new();

        loop {
            let body = self.get_with_retry(&url, false).await?;
            let page: MessagePage = serde_json::from_slice(&body)?;
            for message in page.value {
                messages.push(SourceMessage {
                    id: message.id,
                    internet_message_id: message.internet_message_id,
                });
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(messages)
    }

    /// Raw MIME bytes of one message. An empty body is an error; the caller
    /// is responsible for removing any partial file it created.
    pub async fn download_message(&self, message_id: &str) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "{}/users/{}/messages/{}/$value",
            self.base_url, self.mailbox, message_id
        );
        let bytes = self.get_with_retry(&url, true).await?;
        if bytes.is_empty() {
            return Err(SourceError::EmptyBody(message_id.to_string()));
        }
        Ok(bytes)
    }

    fn folders_url(&self, parent_id: Option<&str>, top: usize) -> Result<Url, SourceError> {
        let endpoint = match parent_id {
            Some(parent) => format!(
                "{}/users/{}/mailFolders/{}/childFolders",
                self.base_url, self.mailbox, parent
            ),
            None => format!("{}/users/{}/mailFolders", self.base_url, self.mailbox),
        };
        let mut url = Url::parse(&endpoint)
            .map_err(|error| SourceError::Transport(format!("parse url {endpoint}: {error}")))?;
        url.query_pairs_mut()
            .append_pair("$top", &top.to_string())
            .append_pair("$select", FOLDER_SELECT_FIELDS);
        Ok(url)
    }

    async fn get_with_retry(&self, url: &str, raw: bool) -> Result<Vec<u8>, SourceError> {
        for attempt in 0..=self.max_retries {
            let token = self.tokens.bearer_token().await?;
            let mut request = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header("ConsistencyLevel", "eventual");
            if !raw {
                request = request.header("accept", "application/json");
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    if attempt == self.max_retries {
                        return Err(SourceError::Transport(error.to_string()));
                    }
                    warn!(url, attempt, "transport error, retrying: {error}");
                    sleep(self.retry_delay).await;
                    continue;
                }
            };

            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let body = match response.bytes().await {
                Ok(body) => body.to_vec(),
                Err(error) => {
                    if attempt == self.max_retries {
                        return Err(SourceError::Transport(error.to_string()));
                    }
                    warn!(url, attempt, "body read error, retrying: {error}");
                    sleep(self.retry_delay).await;
                    continue;
                }
            };

            if is_throttled(status, &body) {
                if attempt == self.max_retries {
                    return Err(SourceError::Throttled {
                        attempts: attempt + 1,
                        detail: truncate_body(&body),
                    });
                }
                let wait = retry_after
                    .map(Duration::from_secs)
                    .unwrap_or(self.retry_delay);
                warn!(url, attempt, wait_secs = wait.as_secs(), "throttled, backing off");
                sleep(wait).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SourceError::Auth(format!(
                    "status={status} body={}",
                    truncate_body(&body)
                )));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(SourceError::NotFound(url.to_string()));
            }
            if status.is_server_error() {
                if attempt == self.max_retries {
                    return Err(SourceError::Status {
                        status: status.as_u16(),
                        detail: truncate_body(&body),
                    });
                }
                warn!(url, attempt, %status, "server error, retrying");
                sleep(self.retry_delay).await;
                continue;
            }
            if !status.is_success() {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    detail: truncate_body(&body),
                });
            }

            debug!(url, bytes = body.len(), "request ok");
            return Ok(body);
        }

        Err(SourceError::Transport(format!(
            "request failed without response: {url}"
        )))
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

fn is_throttled(status: StatusCode, body: &[u8]) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    // The marker is plain ASCII, so a lossy view is safe.
    String::from_utf8_lossy(body).contains(THROTTLE_MARKER)
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() <= ERROR_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < ERROR_BODY_MAX_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// OAuth2 client-credentials token provider for the Graph API, with an
/// expiry-aware in-memory cache. Tokens never touch disk.
pub struct ClientCredentialsProvider {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsProvider {
    pub fn new(
        http: Client,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url_override: Option<String>,
    ) -> Self {
        let token_url = token_url_override.unwrap_or_else(|| {
            format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token")
        });
        Self {
            http,
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<CachedToken, SourceError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|error| SourceError::Transport(format!("token request: {error}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| SourceError::Transport(format!("token response: {error}")))?;
        if !status.is_success() {
            return Err(SourceError::Auth(format!(
                "token request failed: status={status} body={}",
                truncate_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_slice(&body)?;
        let expires_at = Utc::now()
            + chrono::Duration::seconds(
                (payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS),
            );
        Ok(CachedToken {
            access_token: payload.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn bearer_token(&self) -> Result<String, SourceError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }
        let fresh = self.fetch_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_token_response_deserializes() {
        let payload = r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(payload).expect("decode oauth token response");
        assert_eq!(decoded.access_token, "abc");
        assert_eq!(decoded.expires_in, 3600);
    }

    #[test]
    fn cached_token_expiry() {
        let live = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        assert!(!live.is_expired());

        let stale = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(stale.is_expired());
    }

    #[test]
    fn throttle_classification_uses_body_marker() {
        assert!(is_throttled(StatusCode::TOO_MANY_REQUESTS, b""));
        assert!(is_throttled(
            StatusCode::SERVICE_UNAVAILABLE,
            br#"{"error":{"code":"ApplicationThrottled"}}"#
        ));
        assert!(!is_throttled(StatusCode::SERVICE_UNAVAILABLE, b"oops"));
        assert!(!is_throttled(StatusCode::OK, b"body"));
    }

    #[test]
    fn folder_page_deserializes_next_link() {
        let payload = r#"{
            "value": [
                {"id": "f1", "displayName": "Inbox", "childFolderCount": 2},
                {"id": "f2", "displayName": "Archive"}
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next"
        }"#;
        let page: FolderPage = serde_json::from_str(payload).expect("decode folder page");
        assert_eq!(page.value.len(), 2);
        assert_eq!(page.value[0].child_folder_count, Some(2));
        assert_eq!(page.value[1].child_folder_count, None);
        assert!(page.next_link.is_some());
    }

    #[test]
    fn message_page_carries_internet_message_id() {
        let payload = r#"{
            "value": [
                {"id": "m1", "internetMessageId": "<abc@x>"},
                {"id": "m2"}
            ]
        }"#;
        let page: MessagePage = serde_json::from_str(payload).expect("decode message page");
        assert_eq!(
            page.value[0].internet_message_id.as_deref(),
            Some("<abc@x>")
        );
        assert!(page.value[1].internet_message_id.is_none());
        assert!(page.next_link.is_none());
    }

    #[test]
    fn error_bodies_are_truncated() {
        let long = "x".repeat(500);
        let truncated = truncate_body(long.as_bytes());
        assert!(truncated.contains("[truncated 500 bytes]"));
        assert_eq!(truncate_body(b"short"), "short");
    }
}
