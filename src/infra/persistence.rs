//! 遥测持久化
//!
//! 追加写入的记录存储（事件 / 指标 / 配置快照 / 部署历史）。
//! 未配置存储时遥测退化为纯内存模式。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::deploy::HistoryEntry;
use crate::domain::telemetry::{DeploymentEvent, PerformanceMetric};

/// 持久化文件名
const RECORDS_FILE_NAME: &str = "telemetry.jsonl";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// 持久化记录
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum Record {
    Event(DeploymentEvent),
    Metric(PerformanceMetric),
    ConfigSnapshot(ConfigSnapshot),
    History(HistoryEntry),
}

/// 会话开始时的配置快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub config: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Event,
    Metric,
    ConfigSnapshot,
    History,
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Event(_) => RecordType::Event,
            Record::Metric(_) => RecordType::Metric,
            Record::ConfigSnapshot(_) => RecordType::ConfigSnapshot,
            Record::History(_) => RecordType::History,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Record::Event(e) => Some(&e.session_id),
            Record::Metric(m) => Some(&m.session_id),
            Record::ConfigSnapshot(s) => Some(&s.session_id),
            Record::History(h) => h.session_id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Event(e) => e.timestamp,
            Record::Metric(m) => m.timestamp,
            Record::ConfigSnapshot(s) => s.timestamp,
            Record::History(h) => h.started_at,
        }
    }
}

/// 查询条件
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RecordFilter {
    pub record_type: Option<RecordType>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        let type_match = self.record_type.map_or(true, |t| record.record_type() == t);
        let session_match = self
            .session_id
            .as_deref()
            .map_or(true, |s| record.session_id() == Some(s));
        let since_match = self.since.map_or(true, |t| record.timestamp() >= t);
        type_match && session_match && since_match
    }
}

/// 持久化协作者接口
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert(&self, record: Record) -> Result<(), PersistenceError>;

    async fn insert_batch(&self, records: Vec<Record>) -> Result<(), PersistenceError> {
        for record in records {
            self.insert(record).await?;
        }
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, PersistenceError>;
}

/// JSON Lines 文件存储
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// 在数据目录下创建存储
    pub async fn in_dir(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        fs::create_dir_all(dir.as_ref()).await?;
        Ok(Self::new(dir.as_ref().join(RECORDS_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_lines(&self, records: &[Record]) -> Result<(), PersistenceError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), count = records.len(), "Appended telemetry records");
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn insert(&self, record: Record) -> Result<(), PersistenceError> {
        self.append_lines(std::slice::from_ref(&record)).await
    }

    async fn insert_batch(&self, records: Vec<Record>) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        self.append_lines(&records).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, PersistenceError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "Skipping malformed record");
                }
            }
        }

        if let Some(limit) = filter.limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }
}

/// 内存存储（测试及无数据目录时使用）
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert(&self, record: Record) -> Result<(), PersistenceError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn insert_batch(&self, records: Vec<Record>) -> Result<(), PersistenceError> {
        self.records.lock().await.extend(records);
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, PersistenceError> {
        let records = self.records.lock().await;
        let mut matched: Vec<Record> = records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::{EventLevel, EventType};

    fn event(session: &str, message: &str) -> Record {
        Record::Event(DeploymentEvent::new(
            session,
            EventType::StepStarted,
            EventLevel::Info,
            message,
            serde_json::Value::Null,
        ))
    }

    #[tokio::test]
    async fn test_jsonl_insert_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::in_dir(dir.path()).await.unwrap();

        sink.insert(event("s1", "one")).await.unwrap();
        sink.insert_batch(vec![event("s2", "two"), event("s1", "three")])
            .await
            .unwrap();

        let filter = RecordFilter {
            session_id: Some("s1".to_string()),
            ..Default::default()
        };
        let records = sink.query(&filter).await.unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            Record::Event(e) => assert_eq!(e.message, "three"),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("nope.jsonl"));
        assert!(sink.query(&RecordFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_limit_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::in_dir(dir.path()).await.unwrap();
        for i in 0..5 {
            sink.insert(event("s", &format!("e{}", i))).await.unwrap();
        }
        let filter = RecordFilter {
            limit: Some(2),
            ..Default::default()
        };
        let records = sink.query(&filter).await.unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            Record::Event(e) => assert_eq!(e.message, "e3"),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_type() {
        let sink = MemorySink::new();
        sink.insert(event("s", "a")).await.unwrap();
        sink.insert(Record::Metric(PerformanceMetric {
            session_id: "s".into(),
            name: "deploy_duration".into(),
            value: 1.0,
            unit: "s".into(),
            timestamp: Utc::now(),
        }))
        .await
        .unwrap();

        let filter = RecordFilter {
            record_type: Some(RecordType::Metric),
            ..Default::default()
        };
        assert_eq!(sink.query(&filter).await.unwrap().len(), 1);
        assert_eq!(sink.len().await, 2);
    }
}
