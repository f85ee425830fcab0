//! 消息来源 - 只读访问邮箱
//!
//! `MessageSource` 是同步流水线看到的唯一来源接口：
//! - `list_since` 按最新到最旧分页列出消息 ID
//! - `get_detail` 获取单条消息的头部字段

pub mod credentials;
pub mod gmail;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use credentials::{CredentialError, CredentialProvider, TokenFileCredentials};
pub use gmail::GmailSource;

/// 消息 ID（来源侧的不透明标识）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 同步流：每个流有独立的 watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Incoming,
    Outgoing,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Incoming, Stream::Outgoing];

    pub fn name(&self) -> &'static str {
        match self {
            Stream::Incoming => "incoming",
            Stream::Outgoing => "outgoing",
        }
    }

    /// 该流在来源侧对应的系统标签
    pub fn label(&self) -> &'static str {
        match self {
            Stream::Incoming => "INBOX",
            Stream::Outgoing => "SENT",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "incoming" => Ok(Stream::Incoming),
            "outgoing" => Ok(Stream::Outgoing),
            other => Err(format!("unknown stream: {}", other)),
        }
    }
}

/// 消息头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 单次处理用的原始消息，不持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub label_ids: Vec<String>,
    pub headers: Vec<Header>,
    /// 来源记录的接收时间（epoch 毫秒）
    pub internal_date_ms: Option<i64>,
}

impl RawMessage {
    /// 按名称查找头部（大小写不敏感），取第一个
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// 一页列表结果（最新在前）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub ids: Vec<MessageId>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error("source rejected credential (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("source request failed: {0}")]
    Transport(String),
    #[error("malformed source response: {0}")]
    Decode(String),
}

/// 只读邮件来源
pub trait MessageSource: Send + Sync {
    /// 列出某个流的一页消息 ID（最新在前），`cursor` 为上一页返回的游标
    fn list_since(
        &self,
        stream: Stream,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, SourceError>;

    /// 获取消息详情
    fn get_detail(&self, id: &MessageId) -> Result<RawMessage, SourceError>;
}
