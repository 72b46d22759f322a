//! 部署历史存储
//!
//! 有界的历史记录（最新在前），同时写入持久化存储

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::config::env::constants::MAX_HISTORY;
use crate::domain::deploy::{HistoryAction, HistoryEntry};
use crate::infra::persistence::{Record, RecordSink};

/// 部署历史存储
pub struct HistoryStore {
    entries: RwLock<VecDeque<HistoryEntry>>,
    max_entries: usize,
    sink: Option<Arc<dyn RecordSink>>,
}

impl HistoryStore {
    pub fn new(sink: Option<Arc<dyn RecordSink>>) -> Self {
        Self::with_capacity(MAX_HISTORY, sink)
    }

    pub fn with_capacity(max_entries: usize, sink: Option<Arc<dyn RecordSink>>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            sink,
        }
    }

    /// 添加记录；持久化失败只记录日志
    pub async fn record(&self, entry: HistoryEntry) {
        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.insert(Record::History(entry.clone())).await {
                warn!(entry_id = %entry.id, error = %e, "Failed to persist history entry");
            }
        }

        let mut entries = self.entries.write().await;
        entries.push_front(entry);
        while entries.len() > self.max_entries {
            entries.pop_back();
        }
    }

    /// 获取历史记录（最新在前）
    pub async fn list(&self, limit: usize, action: Option<HistoryAction>) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| action.map_or(true, |a| e.action == a))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn latest(&self) -> Option<HistoryEntry> {
        self.entries.read().await.front().cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::CoordinatorStatus;
    use crate::infra::persistence::MemorySink;
    use chrono::Utc;

    fn entry(id: usize, action: HistoryAction) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            action,
            session_id: None,
            strategy: None,
            backend: None,
            deployment_mode: None,
            success: true,
            final_status: CoordinatorStatus::Idle,
            message: String::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_bounded_newest_first() {
        let store = HistoryStore::with_capacity(3, None);
        for i in 0..5 {
            store.record(entry(i, HistoryAction::Deploy)).await;
        }
        let ids: Vec<String> = store.list(10, None).await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_filter_and_persist() {
        let sink = Arc::new(MemorySink::new());
        let store = HistoryStore::new(Some(sink.clone()));
        store.record(entry(1, HistoryAction::Deploy)).await;
        store.record(entry(2, HistoryAction::Stop)).await;

        let stops = store.list(10, Some(HistoryAction::Stop)).await;
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].id, "2");
        assert_eq!(sink.len().await, 2);
        assert_eq!(store.latest().await.unwrap().id, "2");
    }
}
