//! Gmail REST v1 来源
//!
//! - 列表：`GET {base}/users/me/messages?q=<query>&maxResults=<n>&pageToken=<cursor>`
//! - 详情：`GET {base}/users/me/messages/{id}?format=metadata&metadataHeaders=...`

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    CredentialProvider, Header, ListPage, MessageId, MessageSource, RawMessage, SourceError,
    Stream,
};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// 详情只取通知需要的头部
const METADATA_HEADERS: [&str; 4] = ["Subject", "From", "To", "Date"];

/// Gmail 来源配置
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub api_base: String,
    pub incoming_query: String,
    pub outgoing_query: String,
    pub timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            incoming_query: "in:inbox".to_string(),
            outgoing_query: "in:sent".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    /// Gmail 以字符串返回 epoch 毫秒
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<HeaderEntry>,
}

#[derive(Debug, Deserialize)]
struct HeaderEntry {
    name: String,
    value: String,
}

impl From<MessageResponse> for RawMessage {
    fn from(msg: MessageResponse) -> Self {
        RawMessage {
            id: MessageId::new(msg.id),
            label_ids: msg.label_ids,
            headers: msg
                .payload
                .map(|p| {
                    p.headers
                        .into_iter()
                        .map(|h| Header::new(h.name, h.value))
                        .collect()
                })
                .unwrap_or_default(),
            internal_date_ms: msg.internal_date.and_then(|d| d.trim().parse().ok()),
        }
    }
}

/// Gmail API 客户端
pub struct GmailSource {
    http: reqwest::blocking::Client,
    credentials: Arc<dyn CredentialProvider>,
    config: GmailConfig,
}

impl GmailSource {
    pub fn new(config: GmailConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self, SourceError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Transport(format!("Cannot create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credentials,
            config,
        })
    }

    fn query_for(&self, stream: Stream) -> &str {
        match stream {
            Stream::Incoming => &self.config.incoming_query,
            Stream::Outgoing => &self.config.outgoing_query,
        }
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        let token = self.credentials.bearer_token()?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| SourceError::Transport(format!("Failed to read response: {}", e)))?;

        match status.as_u16() {
            200..=299 => Ok(body),
            401 | 403 => Err(SourceError::Unauthorized {
                status: status.as_u16(),
            }),
            code => Err(SourceError::Status { status: code, body }),
        }
    }
}

impl MessageSource for GmailSource {
    fn list_since(
        &self,
        stream: Stream,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, SourceError> {
        let url = format!("{}/users/me/messages", self.config.api_base);
        let mut query = vec![
            ("q", self.query_for(stream).to_string()),
            ("maxResults", page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("pageToken", cursor.to_string()));
        }

        debug!(stream = %stream, cursor = ?cursor, page_size, "Listing messages");
        let body = self.get(&url, &query)?;
        let list: ListResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(ListPage {
            ids: list.messages.into_iter().map(|m| MessageId::new(m.id)).collect(),
            next_cursor: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn get_detail(&self, id: &MessageId) -> Result<RawMessage, SourceError> {
        let url = format!("{}/users/me/messages/{}", self.config.api_base, id);
        let mut query = vec![("format", "metadata".to_string())];
        query.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", h.to_string())));

        let body = match self.get(&url, &query) {
            Err(SourceError::Status { status: 404, .. }) => {
                return Err(SourceError::NotFound(id.clone()))
            }
            other => other?,
        };
        let msg: MessageResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(msg.into())
    }
}
