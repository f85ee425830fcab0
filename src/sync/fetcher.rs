//! Watermark 拉取 - 取回比 watermark 更新的消息，按从旧到新返回
//!
//! ## 拉取规则
//! 1. 冷启动（无 watermark）只取最新一条，不回放历史
//! 2. 否则从最新一页向旧翻页，遇到 watermark 即停止（不含 watermark 本身）
//! 3. 翻页耗尽或达到 `max_pages` 仍未见到 watermark（已归档或删除）时，
//!    只保留 internalDate 晚于 watermark 时间的消息；watermark 没有时间时按冷启动处理
//! 4. 结果反转为从旧到新

use std::sync::Arc;
use tracing::{debug, warn};

use super::checkpoint::Watermark;
use crate::source::{MessageId, MessageSource, RawMessage, SourceError, Stream};

pub struct WatermarkFetcher {
    source: Arc<dyn MessageSource>,
    page_size: u32,
    max_pages: u32,
}

/// 翻页结果：最新在前的 ID，以及是否遇到了 watermark
struct Window {
    ids: Vec<MessageId>,
    reached_mark: bool,
}

impl WatermarkFetcher {
    pub fn new(source: Arc<dyn MessageSource>, page_size: u32, max_pages: u32) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// 拉取 `watermark` 之后的新消息（从旧到新）
    ///
    /// 任何来源错误都直接返回，调用方保持 watermark 不变，下个周期重试同一窗口。
    pub fn fetch_since(
        &self,
        stream: Stream,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let Some(mark) = watermark else {
            let ids = self.newest(stream)?;
            return self.details(stream, ids);
        };

        let window = self.window_after(stream, &mark.id)?;
        if window.reached_mark {
            let mut ids = window.ids;
            ids.reverse();
            return self.details(stream, ids);
        }

        match mark.internal_date_ms {
            Some(cutoff) => {
                warn!(
                    stream = %stream,
                    watermark = %mark.id,
                    listed = window.ids.len(),
                    "Watermark no longer listed, falling back to its internal date"
                );
                self.newer_than(stream, window.ids, cutoff)
            }
            None => {
                warn!(
                    stream = %stream,
                    watermark = %mark.id,
                    "Watermark no longer listed and has no date, re-anchoring on newest message"
                );
                let ids = window.ids.into_iter().take(1).collect();
                self.details(stream, ids)
            }
        }
    }

    fn newest(&self, stream: Stream) -> Result<Vec<MessageId>, SourceError> {
        let page = self.source.list_since(stream, None, 1)?;
        Ok(page.ids.into_iter().take(1).collect())
    }

    /// 最新在前的 ID 列表，截止到 watermark（不含）
    fn window_after(&self, stream: Stream, mark: &MessageId) -> Result<Window, SourceError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 1..=self.max_pages {
            let page = self.source.list_since(stream, cursor.as_deref(), self.page_size)?;

            for id in page.ids {
                if &id == mark {
                    debug!(stream = %stream, page = page_no, "Reached watermark");
                    return Ok(Window { ids, reached_mark: true });
                }
                ids.push(id);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(Window { ids, reached_mark: false }),
            }
        }

        debug!(stream = %stream, max_pages = self.max_pages, "Page limit reached before watermark");
        Ok(Window { ids, reached_mark: false })
    }

    /// 从最新往旧取详情，遇到不晚于 `cutoff` 的消息即停止
    ///
    /// 没有 internalDate 的消息无法比较，同样视为边界。
    fn newer_than(&self, stream: Stream, ids: Vec<MessageId>, cutoff: i64) -> Result<Vec<RawMessage>, SourceError> {
        let mut messages = Vec::new();
        for id in ids {
            match self.source.get_detail(&id) {
                Ok(raw) if raw.internal_date_ms.is_some_and(|ms| ms > cutoff) => messages.push(raw),
                Ok(raw) => {
                    debug!(stream = %stream, message_id = %raw.id, "Reached messages older than watermark");
                    break;
                }
                Err(SourceError::NotFound(missing)) => {
                    warn!(stream = %stream, message_id = %missing, "Message vanished before detail fetch, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        messages.reverse();

        debug!(stream = %stream, count = messages.len(), "Fetched new messages");
        Ok(messages)
    }

    /// 按给定顺序取详情，已消失的消息跳过
    fn details(&self, stream: Stream, ids: Vec<MessageId>) -> Result<Vec<RawMessage>, SourceError> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.source.get_detail(&id) {
                Ok(raw) => messages.push(raw),
                Err(SourceError::NotFound(missing)) => {
                    warn!(stream = %stream, message_id = %missing, "Message vanished before detail fetch, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(stream = %stream, count = messages.len(), "Fetched new messages");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Header, ListPage};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 最新在前的假邮箱，记录每次翻页请求
    struct PagedSource {
        ids: Vec<&'static str>,
        missing: HashSet<&'static str>,
        /// 为真时 internalDate = ID 数值（秒）
        dated: bool,
        list_calls: Mutex<Vec<Option<String>>>,
        detail_calls: Mutex<usize>,
    }

    impl PagedSource {
        fn new(ids: Vec<&'static str>) -> Self {
            Self {
                ids,
                missing: HashSet::new(),
                dated: false,
                list_calls: Mutex::new(Vec::new()),
                detail_calls: Mutex::new(0),
            }
        }

        fn dated(ids: Vec<&'static str>) -> Self {
            Self {
                dated: true,
                ..Self::new(ids)
            }
        }

        fn detail_calls(&self) -> usize {
            *self.detail_calls.lock().unwrap()
        }

        fn list_calls(&self) -> Vec<Option<String>> {
            self.list_calls.lock().unwrap().clone()
        }
    }

    impl MessageSource for PagedSource {
        fn list_since(&self, _stream: Stream, cursor: Option<&str>, page_size: u32) -> Result<ListPage, SourceError> {
            self.list_calls.lock().unwrap().push(cursor.map(String::from));
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + page_size as usize).min(self.ids.len());
            Ok(ListPage {
                ids: self.ids[start..end].iter().map(|id| MessageId::new(*id)).collect(),
                next_cursor: (end < self.ids.len()).then(|| end.to_string()),
            })
        }

        fn get_detail(&self, id: &MessageId) -> Result<RawMessage, SourceError> {
            *self.detail_calls.lock().unwrap() += 1;
            if self.missing.contains(id.as_str()) {
                return Err(SourceError::NotFound(id.clone()));
            }
            Ok(RawMessage {
                id: id.clone(),
                label_ids: vec!["INBOX".to_string()],
                headers: vec![Header::new("Subject", format!("msg {}", id))],
                internal_date_ms: self
                    .dated
                    .then(|| id.as_str().parse::<i64>().ok().map(|secs| secs * 1000))
                    .flatten(),
            })
        }
    }

    fn mark(id: &str) -> Watermark {
        Watermark::new(MessageId::new(id))
    }

    fn ids(messages: &[RawMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_cold_start_returns_only_newest() {
        let source = Arc::new(PagedSource::new(vec!["5", "4", "3"]));
        let fetcher = WatermarkFetcher::new(source.clone(), 10, 10);

        let messages = fetcher.fetch_since(Stream::Incoming, None).unwrap();
        assert_eq!(ids(&messages), vec!["5"]);
    }

    #[test]
    fn test_stops_at_watermark_and_returns_oldest_first() {
        let source = Arc::new(PagedSource::new(vec!["8", "7", "6", "5", "4"]));
        let fetcher = WatermarkFetcher::new(source, 10, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("5")))
            .unwrap();
        assert_eq!(ids(&messages), vec!["6", "7", "8"]);
    }

    #[test]
    fn test_no_request_after_watermark_page() {
        // 每页 2 条：[9,8] [7,6] [5,4] [3]
        let source = Arc::new(PagedSource::new(vec!["9", "8", "7", "6", "5", "4", "3"]));
        let fetcher = WatermarkFetcher::new(source.clone(), 2, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("5")))
            .unwrap();

        assert_eq!(ids(&messages), vec!["6", "7", "8", "9"]);
        assert_eq!(
            source.list_calls(),
            vec![None, Some("2".to_string()), Some("4".to_string())]
        );
    }

    #[test]
    fn test_nothing_new_when_watermark_is_newest() {
        let source = Arc::new(PagedSource::new(vec!["5", "4"]));
        let fetcher = WatermarkFetcher::new(source, 10, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("5")))
            .unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_lost_watermark_delivers_only_newer_dates() {
        // watermark 60 已归档，之后只来了 61
        let source = Arc::new(PagedSource::dated(vec!["61", "59", "58", "57", "56", "55"]));
        let fetcher = WatermarkFetcher::new(source.clone(), 2, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("60").with_internal_date(60_000)))
            .unwrap();

        assert_eq!(ids(&messages), vec!["61"]);
        // 61 和边界 59 各取一次详情
        assert_eq!(source.detail_calls(), 2);
    }

    #[test]
    fn test_lost_watermark_with_nothing_newer_delivers_nothing() {
        let source = Arc::new(PagedSource::dated(vec!["59", "58", "57", "56", "55"]));
        let fetcher = WatermarkFetcher::new(source.clone(), 2, 2);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("60").with_internal_date(60_000)))
            .unwrap();

        assert!(messages.is_empty());
        assert_eq!(source.list_calls().len(), 2);
    }

    #[test]
    fn test_lost_undated_watermark_reanchors_on_newest() {
        let source = Arc::new(PagedSource::new(vec!["6", "5", "4", "3", "2", "1"]));
        let fetcher = WatermarkFetcher::new(source.clone(), 2, 2);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("deleted")))
            .unwrap();

        assert_eq!(ids(&messages), vec!["6"]);
        assert_eq!(source.list_calls().len(), 2);
    }

    #[test]
    fn test_message_without_date_ends_lost_watermark_window() {
        let source = Arc::new(PagedSource::dated(vec!["70", "x", "65"]));
        let fetcher = WatermarkFetcher::new(source, 10, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("60").with_internal_date(60_000)))
            .unwrap();

        assert_eq!(ids(&messages), vec!["70"]);
    }

    #[test]
    fn test_vanished_message_is_skipped() {
        let mut source = PagedSource::new(vec!["8", "7", "6", "5"]);
        source.missing.insert("7");
        let fetcher = WatermarkFetcher::new(Arc::new(source), 10, 10);

        let messages = fetcher
            .fetch_since(Stream::Incoming, Some(&mark("5")))
            .unwrap();
        assert_eq!(ids(&messages), vec!["6", "8"]);
    }

    #[test]
    fn test_empty_mailbox_cold_start() {
        let fetcher = WatermarkFetcher::new(Arc::new(PagedSource::new(vec![])), 10, 10);
        assert!(fetcher.fetch_since(Stream::Outgoing, None).unwrap().is_empty());
    }
}
