//! Discord 卡片样式 - 按方向固定的两种样式，外加错误告警样式
//!
//! Webhook 载荷格式：
//! ```json
//! {
//!   "username": "Inbox Relay",
//!   "avatar_url": "https://...",
//!   "embeds": [{ "title": "📬 **New Email Received**", "description": "...", "color": 3447003 }]
//! }
//! ```

use serde::Serialize;

use super::record::{Direction, NotificationRecord};
use super::reporter::ErrorReport;

/// Discord embed description 上限
pub const MAX_DESCRIPTION_CHARS: usize = 4096;

/// 单个方向的样式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedStyle {
    pub emoji: &'static str,
    pub color: u32,
    pub title: &'static str,
    pub contact_label: &'static str,
}

const INCOMING: EmbedStyle = EmbedStyle {
    emoji: "📬",
    color: 3447003,
    title: "New Email Received",
    contact_label: "From",
};

const OUTGOING: EmbedStyle = EmbedStyle {
    emoji: "✈️",
    color: 4437377,
    title: "New Email Sent",
    contact_label: "To",
};

const ERROR_ALERT: EmbedStyle = EmbedStyle {
    emoji: "❌",
    color: 15158332,
    title: "Error Alert",
    contact_label: "",
};

pub fn style_for(direction: Direction) -> &'static EmbedStyle {
    match direction {
        Direction::Incoming => &INCOMING,
        Direction::Outgoing => &OUTGOING,
    }
}

/// 发送者身份（用户名和头像）
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub embeds: Vec<Embed>,
}

/// 渲染邮件通知
pub fn render_notification(record: &NotificationRecord, identity: &Identity) -> WebhookPayload {
    let style = style_for(record.direction);
    let description = format!(
        "**{}: **{}\n**Subject:** {}\n**Time: **{}",
        style.contact_label,
        record.main_contact(),
        record.subject,
        record.timestamp.display()
    );

    WebhookPayload {
        username: identity.username.clone(),
        avatar_url: identity.avatar_url.clone(),
        embeds: vec![Embed {
            title: format!("{} **{}**", style.emoji, style.title),
            description: truncate(&description, MAX_DESCRIPTION_CHARS),
            color: style.color,
        }],
    }
}

/// 渲染错误告警
pub fn render_error(report: &ErrorReport, identity: &Identity) -> WebhookPayload {
    let mut description = format!(
        "**Operation:** `{}`\n**Type:** `{}`\n**Time:** {}\n",
        report.operation,
        report.error_type,
        report.timestamp.to_rfc3339()
    );
    if let Some(id) = &report.message_id {
        description.push_str(&format!("**Message:** `{}`\n", id));
    }
    description.push_str(&format!("**Error:**\n```\n{}\n```", report.error));
    if let Some(context) = &report.context {
        let pretty = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        description.push_str(&format!("\n**Context:**\n```\n{}\n```", pretty));
    }

    WebhookPayload {
        username: identity.username.as_ref().map(|name| format!("{} - Error", name)),
        avatar_url: identity.avatar_url.clone(),
        embeds: vec![Embed {
            title: format!("{} {}", ERROR_ALERT.emoji, ERROR_ALERT.title),
            description: truncate(&description, MAX_DESCRIPTION_CHARS),
            color: ERROR_ALERT.color,
        }],
    }
}

/// 按字符截断（不切断 UTF-8 字符）
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::record::Timestamp;
    use crate::source::MessageId;

    fn record(direction: Direction) -> NotificationRecord {
        NotificationRecord {
            direction,
            subject: "Invoice #42".to_string(),
            sender: "Alice <alice@example.com>, bob@example.com".to_string(),
            recipient: "carol@example.com".to_string(),
            timestamp: Timestamp::Verbatim("19/10/2026 08:20".to_string()),
            source_message_id: MessageId::new("18c2f"),
        }
    }

    #[test]
    fn test_incoming_card() {
        let payload = render_notification(&record(Direction::Incoming), &Identity::default());
        let embed = &payload.embeds[0];

        assert_eq!(embed.title, "📬 **New Email Received**");
        assert_eq!(embed.color, 3447003);
        assert_eq!(
            embed.description,
            "**From: **Alice <alice@example.com>\n**Subject:** Invoice #42\n**Time: **19/10/2026 08:20"
        );
    }

    #[test]
    fn test_outgoing_card_uses_recipient() {
        let payload = render_notification(&record(Direction::Outgoing), &Identity::default());
        let embed = &payload.embeds[0];

        assert_eq!(embed.title, "✈️ **New Email Sent**");
        assert_eq!(embed.color, 4437377);
        assert!(embed.description.starts_with("**To: **carol@example.com\n"));
    }

    #[test]
    fn test_identity_is_optional_in_json() {
        let bare = serde_json::to_value(render_notification(&record(Direction::Incoming), &Identity::default())).unwrap();
        assert!(bare.get("username").is_none());

        let identity = Identity {
            username: Some("Inbox Relay".to_string()),
            avatar_url: Some("https://example.com/a.png".to_string()),
        };
        let named = serde_json::to_value(render_notification(&record(Direction::Incoming), &identity)).unwrap();
        assert_eq!(named["username"], "Inbox Relay");
        assert_eq!(named["embeds"][0]["color"], 3447003);
    }

    #[test]
    fn test_error_card_is_truncated() {
        let report = ErrorReport::new("fetch:incoming", "Transport", "x".repeat(10_000));
        let payload = render_error(&report, &Identity::default());
        let description = &payload.embeds[0].description;

        assert_eq!(description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(description.ends_with("..."));
        assert_eq!(payload.embeds[0].color, 15158332);
    }

    #[test]
    fn test_truncate_respects_multibyte_chars() {
        assert_eq!(truncate("短消息", 10), "短消息");
        assert_eq!(truncate("这是一条很长很长的消息", 6), "这是一...");
    }
}
