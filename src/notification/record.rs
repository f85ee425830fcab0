//! 通知记录 - 规范化后的一封邮件，送达或入队各一次

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::source::{MessageId, Stream};

/// 展示用时间格式
pub const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M";

/// 通知方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl From<Stream> for Direction {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Incoming => Direction::Incoming,
            Stream::Outgoing => Direction::Outgoing,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!(
                "invalid direction '{}', must be 'incoming' or 'outgoing'",
                other
            )),
        }
    }
}

/// 消息时间：解析成功则带时区，否则原样保留头部文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    Parsed(DateTime<FixedOffset>),
    Verbatim(String),
}

impl Timestamp {
    /// 本地时区展示
    pub fn display(&self) -> String {
        match self {
            Timestamp::Parsed(dt) => dt.with_timezone(&Local).format(DISPLAY_FORMAT).to_string(),
            Timestamp::Verbatim(raw) => raw.clone(),
        }
    }
}

/// 规范化后的通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub direction: Direction,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub timestamp: Timestamp,
    pub source_message_id: MessageId,
}

impl NotificationRecord {
    /// 卡片上展示的主要联系人：收件看发件人，发件看收件人（只取第一个地址）
    pub fn main_contact(&self) -> &str {
        let field = match self.direction {
            Direction::Incoming => &self.sender,
            Direction::Outgoing => &self.recipient,
        };
        field.split(',').next().unwrap_or(field).trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(direction: Direction, sender: &str, recipient: &str) -> NotificationRecord {
        NotificationRecord {
            direction,
            subject: "Hi".to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: Timestamp::Verbatim("yesterday".to_string()),
            source_message_id: MessageId::new("1"),
        }
    }

    #[test]
    fn test_direction_rejects_unknown_value() {
        assert_eq!("incoming".parse::<Direction>().unwrap(), Direction::Incoming);
        let err = "sideways".parse::<Direction>().unwrap_err();
        assert!(err.contains("sideways"));

        let parsed: Result<Direction, _> = serde_json::from_str("\"sideways\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_main_contact_takes_first_address() {
        let incoming = record(Direction::Incoming, "Alice <a@x.com>", "me@x.com");
        assert_eq!(incoming.main_contact(), "Alice <a@x.com>");

        let outgoing = record(Direction::Outgoing, "me@x.com", " bob@x.com , carol@x.com");
        assert_eq!(outgoing.main_contact(), "bob@x.com");
    }

    #[test]
    fn test_verbatim_timestamp_displays_as_is() {
        let ts = Timestamp::Verbatim("sometime last week".to_string());
        assert_eq!(ts.display(), "sometime last week");
    }

    #[test]
    fn test_record_serialization_keeps_direction_lowercase() {
        let json = serde_json::to_value(record(Direction::Outgoing, "a", "b")).unwrap();
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["timestamp"]["kind"], "verbatim");
    }
}
