//! OAuth 凭据 - 读取 authorized-user 格式的 token.json，临近过期时自动刷新
//!
//! token.json 由一次性的授权工具生成，字段与 google-auth 的
//! `Credentials.to_json()` 一致：
//! ```json
//! {
//!   "token": "ya29...",
//!   "refresh_token": "1//0g...",
//!   "token_uri": "https://oauth2.googleapis.com/token",
//!   "client_id": "...",
//!   "client_secret": "...",
//!   "scopes": ["https://www.googleapis.com/auth/gmail.readonly"],
//!   "expiry": "2026-10-19T08:20:52.123456Z"
//! }
//! ```

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::infra::json_file::{read_json, write_json_atomic};

/// 剩余有效期低于此值即刷新
const REFRESH_MARGIN_SECS: i64 = 60;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token file {path} unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("token is invalid and cannot be refreshed")]
    Unrefreshable,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// 提供有效的 bearer token
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// authorized-user token 文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

impl AuthorizedUser {
    /// 解析 expiry（RFC 3339，或不带时区的 UTC 时间）
    pub fn expiry_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.expiry.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// 在 `now` 时刻 access token 是否仍可直接使用
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        match self.expiry_at() {
            Some(expiry) => has_token && expiry - ChronoDuration::seconds(REFRESH_MARGIN_SECS) > now,
            // 无过期时间：视为可用，由来源返回 401 再处理
            None => has_token,
        }
    }

    fn can_refresh(&self) -> bool {
        [&self.refresh_token, &self.client_id, &self.client_secret]
            .iter()
            .all(|f| f.as_deref().is_some_and(|v| !v.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// 基于 token.json 的凭据提供者
pub struct TokenFileCredentials {
    path: PathBuf,
    http: reqwest::blocking::Client,
    cached: Mutex<Option<AuthorizedUser>>,
}

impl TokenFileCredentials {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, CredentialError> {
        let path = path.into();
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::RefreshFailed(format!("Cannot create HTTP client: {}", e)))?;

        Ok(Self {
            path,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<AuthorizedUser, CredentialError> {
        read_json::<AuthorizedUser>(&self.path)
            .map_err(|e| CredentialError::Unreadable {
                path: self.path.clone(),
                reason: format!("{:#}", e),
            })?
            .ok_or_else(|| CredentialError::Unreadable {
                path: self.path.clone(),
                reason: "file missing or empty".to_string(),
            })
    }

    fn refresh(&self, user: &mut AuthorizedUser) -> Result<(), CredentialError> {
        if !user.can_refresh() {
            return Err(CredentialError::Unrefreshable);
        }

        let token_uri = user
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", user.refresh_token.as_deref().unwrap_or_default()),
            ("client_id", user.client_id.as_deref().unwrap_or_default()),
            ("client_secret", user.client_secret.as_deref().unwrap_or_default()),
        ];

        debug!(token_uri = %token_uri, "Refreshing OAuth access token");
        let response = self
            .http
            .post(&token_uri)
            .form(&form)
            .send()
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;
        if status.as_u16() == 400 || status.as_u16() == 401 {
            // invalid_grant：refresh token 已被撤销
            return Err(CredentialError::Unrefreshable);
        }
        if !status.is_success() {
            return Err(CredentialError::RefreshFailed(format!("HTTP {}: {}", status, body)));
        }

        let refreshed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::RefreshFailed(format!("bad refresh response: {}", e)))?;

        user.token = Some(refreshed.access_token);
        user.expiry = refreshed
            .expires_in
            .map(|secs| (Utc::now() + ChronoDuration::seconds(secs)).to_rfc3339());
        if let Some(rotated) = refreshed.refresh_token {
            user.refresh_token = Some(rotated);
        }

        write_json_atomic(&self.path, user).map_err(|e| CredentialError::Unreadable {
            path: self.path.clone(),
            reason: format!("write back failed: {:#}", e),
        })?;
        info!(path = %self.path.display(), "OAuth access token refreshed");
        Ok(())
    }
}

impl CredentialProvider for TokenFileCredentials {
    fn bearer_token(&self) -> Result<String, CredentialError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CredentialError::RefreshFailed("credential cache poisoned".to_string()))?;

        let mut user = match cached.take() {
            Some(user) => user,
            None => self.load()?,
        };

        if !user.is_fresh(Utc::now()) {
            self.refresh(&mut user)?;
        }

        let token = user.token.clone().ok_or(CredentialError::Unrefreshable)?;
        *cached = Some(user);
        Ok(token)
    }
}
