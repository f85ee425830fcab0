//! 消息规范化 - 原始消息 → 通知记录
//!
//! ## 规则
//! 1. 头部缺失时使用固定占位文本
//! 2. DRAFT / SCHEDULED 标签的消息被过滤（不是错误）
//! 3. 收件人为空或匹配“隐藏收件人”模式时替换为占位文本
//! 4. 时间优先取来源的接收时间，其次解析 Date 头，都失败则原样保留

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

use super::record::{Direction, NotificationRecord, Timestamp};
use crate::source::{MessageId, RawMessage, Stream};

pub const NO_SUBJECT: &str = "No Subject";
pub const NO_SENDER: &str = "No Sender";
pub const NO_RECIPIENT: &str = "No Recipient";
pub const NO_DATE: &str = "No Date";
pub const HIDDEN_RECIPIENTS: &str = "[BCC recipients not visible after sending]";

/// 默认的隐藏收件人模式（已小写并去除空白）
pub const DEFAULT_HIDDEN_PATTERNS: [&str; 2] = ["undisclosed-recipients:;", "undisclosedrecipients:;"];

/// 被过滤的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Draft,
    Scheduled,
}

/// 规范化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Record(NotificationRecord),
    Filtered(FilterReason),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("message {id} has no recognizable direction (labels: {labels:?})")]
    UnknownDirection { id: MessageId, labels: Vec<String> },
}

pub struct Normalizer {
    hidden_patterns: Vec<String>,
    date_comment: Regex,
}

impl Normalizer {
    pub fn new<I, S>(hidden_patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hidden_patterns: hidden_patterns
                .into_iter()
                .map(|p| squash(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
            // 例如 "Tue, 14 Oct 2025 09:15:00 +0000 (UTC)"
            date_comment: Regex::new(r"\s*\([^)]*\)\s*$").expect("static regex"),
        }
    }

    pub fn normalize(&self, raw: &RawMessage, stream: Stream) -> Result<Normalized, NormalizeError> {
        if raw.has_label("DRAFT") {
            return Ok(Normalized::Filtered(FilterReason::Draft));
        }
        if raw.has_label("SCHEDULED") {
            return Ok(Normalized::Filtered(FilterReason::Scheduled));
        }

        let direction = classify(raw, stream).ok_or_else(|| NormalizeError::UnknownDirection {
            id: raw.id.clone(),
            labels: raw.label_ids.clone(),
        })?;

        let header = |name: &str, fallback: &str| {
            raw.header(name).unwrap_or(fallback).to_string()
        };

        Ok(Normalized::Record(NotificationRecord {
            direction,
            subject: header("Subject", NO_SUBJECT),
            sender: header("From", NO_SENDER),
            recipient: self.sanitize_recipient(&header("To", NO_RECIPIENT)),
            timestamp: self.timestamp(raw),
            source_message_id: raw.id.clone(),
        }))
    }

    fn sanitize_recipient(&self, recipient: &str) -> String {
        let squashed = squash(recipient);
        if recipient.trim().is_empty() || self.hidden_patterns.contains(&squashed) {
            HIDDEN_RECIPIENTS.to_string()
        } else {
            recipient.to_string()
        }
    }

    fn timestamp(&self, raw: &RawMessage) -> Timestamp {
        if let Some(ms) = raw.internal_date_ms.filter(|ms| *ms > 0) {
            if let Some(dt) = Utc.timestamp_millis_opt(ms).single() {
                return Timestamp::Parsed(dt.fixed_offset());
            }
        }

        match raw.header("Date") {
            Some(date) => {
                let cleaned = self.date_comment.replace(date.trim(), "");
                DateTime::parse_from_rfc2822(&cleaned)
                    .map(Timestamp::Parsed)
                    .unwrap_or_else(|_| Timestamp::Verbatim(date.to_string()))
            }
            None => Timestamp::Verbatim(NO_DATE.to_string()),
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_HIDDEN_PATTERNS)
    }
}

/// 本流标签优先（发给自己的邮件同时带 INBOX 和 SENT）
fn classify(raw: &RawMessage, stream: Stream) -> Option<Direction> {
    if raw.has_label(stream.label()) {
        return Some(stream.into());
    }
    Stream::ALL
        .into_iter()
        .find(|s| raw.has_label(s.label()))
        .map(Direction::from)
}

/// 小写并去除所有空白
fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Header;

    fn raw(labels: &[&str], headers: &[(&str, &str)], internal_date_ms: Option<i64>) -> RawMessage {
        RawMessage {
            id: MessageId::new("m1"),
            label_ids: labels.iter().map(|l| l.to_string()).collect(),
            headers: headers.iter().map(|(n, v)| Header::new(*n, *v)).collect(),
            internal_date_ms,
        }
    }

    fn record(n: Normalized) -> NotificationRecord {
        match n {
            Normalized::Record(r) => r,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_headers_use_sentinels() {
        let n = Normalizer::default();
        let r = record(n.normalize(&raw(&["INBOX"], &[], None), Stream::Incoming).unwrap());

        assert_eq!(r.subject, NO_SUBJECT);
        assert_eq!(r.sender, NO_SENDER);
        assert_eq!(r.recipient, NO_RECIPIENT);
        assert_eq!(r.timestamp, Timestamp::Verbatim(NO_DATE.to_string()));
        assert_eq!(r.direction, Direction::Incoming);
    }

    #[test]
    fn test_drafts_and_scheduled_are_filtered() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize(&raw(&["DRAFT", "SENT"], &[], None), Stream::Outgoing).unwrap(),
            Normalized::Filtered(FilterReason::Draft)
        );
        assert_eq!(
            n.normalize(&raw(&["SCHEDULED"], &[], None), Stream::Outgoing).unwrap(),
            Normalized::Filtered(FilterReason::Scheduled)
        );
    }

    #[test]
    fn test_hidden_recipients_are_replaced() {
        let n = Normalizer::default();
        for to in ["undisclosed-recipients:;", " Undisclosed-Recipients: ; ", "undisclosed recipients:;", "   "] {
            let r = record(n.normalize(&raw(&["SENT"], &[("To", to)], None), Stream::Outgoing).unwrap());
            assert_eq!(r.recipient, HIDDEN_RECIPIENTS, "recipient {:?}", to);
        }

        let r = record(
            n.normalize(&raw(&["SENT"], &[("To", "bob@example.com")], None), Stream::Outgoing)
                .unwrap(),
        );
        assert_eq!(r.recipient, "bob@example.com");
    }

    #[test]
    fn test_direction_prefers_stream_label() {
        let n = Normalizer::default();
        let to_self = raw(&["INBOX", "SENT"], &[], None);

        assert_eq!(record(n.normalize(&to_self, Stream::Incoming).unwrap()).direction, Direction::Incoming);
        assert_eq!(record(n.normalize(&to_self, Stream::Outgoing).unwrap()).direction, Direction::Outgoing);

        // 本流标签缺失时退回其他已知标签
        let sent_only = raw(&["SENT"], &[], None);
        assert_eq!(record(n.normalize(&sent_only, Stream::Incoming).unwrap()).direction, Direction::Outgoing);
    }

    #[test]
    fn test_unknown_direction_is_data_error() {
        let n = Normalizer::default();
        let err = n.normalize(&raw(&["CATEGORY_PROMOTIONS"], &[], None), Stream::Incoming).unwrap_err();
        assert!(matches!(err, NormalizeError::UnknownDirection { .. }));
    }

    #[test]
    fn test_internal_date_wins_over_header() {
        let n = Normalizer::default();
        let msg = raw(&["INBOX"], &[("Date", "Mon, 1 Jan 2001 00:00:00 +0000")], Some(1_760_862_052_000));
        let r = record(n.normalize(&msg, Stream::Incoming).unwrap());

        let expected = Utc.timestamp_millis_opt(1_760_862_052_000).unwrap().fixed_offset();
        assert_eq!(r.timestamp, Timestamp::Parsed(expected));
    }

    #[test]
    fn test_date_header_parsed_with_timezone_and_comment() {
        let n = Normalizer::default();
        let msg = raw(&["INBOX"], &[("Date", "Tue, 14 Oct 2025 09:15:00 +0200 (CEST)")], None);
        let r = record(n.normalize(&msg, Stream::Incoming).unwrap());

        let expected = DateTime::parse_from_rfc3339("2025-10-14T09:15:00+02:00").unwrap();
        assert_eq!(r.timestamp, Timestamp::Parsed(expected));
    }

    #[test]
    fn test_unparsable_date_passed_through() {
        let n = Normalizer::default();
        let msg = raw(&["INBOX"], &[("Date", "the day before yesterday")], None);
        let r = record(n.normalize(&msg, Stream::Incoming).unwrap());
        assert_eq!(r.timestamp, Timestamp::Verbatim("the day before yesterday".to_string()));
    }
}
