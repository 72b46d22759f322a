//! 部署遥测
//!
//! 按会话缓冲事件与指标，满缓冲 / 定时 / 会话结束时写入持久化存储。
//! - 每个会话单写者，事件按记录顺序编号与落盘
//! - 指标超过阈值时自动生成对应级别的事件
//! - ERROR/CRITICAL 事件同步通知告警订阅者，订阅者失败只记录日志
//! - 所有事件同时广播给实时订阅者（SSE）

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env::TelemetryConfig;
use crate::domain::telemetry::{
    DeploymentEvent, EventLevel, EventType, PerformanceMetric, SessionInfo, SessionSummary,
};
use crate::infra::persistence::{ConfigSnapshot, Record, RecordFilter, RecordSink};
use crate::error::DeployResult;

/// 内存中保留的最大会话数（超出时淘汰最早的已结束或隐式会话）
const MAX_RETAINED_SESSIONS: usize = 50;

/// 告警订阅者
pub trait AlertSubscriber: Send + Sync {
    fn name(&self) -> &str;

    fn on_alert(&self, event: &DeploymentEvent) -> Result<(), String>;
}

/// 闭包形式的订阅者
pub struct FnSubscriber<F> {
    name: String,
    callback: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&DeploymentEvent) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

impl<F> AlertSubscriber for FnSubscriber<F>
where
    F: Fn(&DeploymentEvent) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_alert(&self, event: &DeploymentEvent) -> Result<(), String> {
        (self.callback)(event)
    }
}

/// 单个会话的状态
///
/// `events` / `metrics` 是有界的内存副本，完整记录以落盘为准
struct Session {
    started_at: DateTime<Utc>,
    /// 由 start_session 显式创建
    explicit: bool,
    next_sequence: u64,
    metric_total: usize,
    events: VecDeque<DeploymentEvent>,
    metrics: VecDeque<PerformanceMetric>,
    pending: Vec<Record>,
    pending_events: usize,
    pending_metrics: usize,
    summary: Option<SessionSummary>,
}

impl Session {
    fn new(explicit: bool) -> Self {
        Self {
            started_at: Utc::now(),
            explicit,
            next_sequence: 0,
            metric_total: 0,
            events: VecDeque::new(),
            metrics: VecDeque::new(),
            pending: Vec::new(),
            pending_events: 0,
            pending_metrics: 0,
            summary: None,
        }
    }

    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            started_at: self.started_at,
            ended: self.summary.is_some(),
            event_count: self.next_sequence as usize,
            metric_count: self.metric_total,
        }
    }

    fn push_event(&mut self, event: DeploymentEvent, limit: usize) {
        if self.events.len() >= limit.max(1) {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn push_metric(&mut self, metric: PerformanceMetric, limit: usize) {
        self.metric_total += 1;
        if self.metrics.len() >= limit.max(1) {
            self.metrics.pop_front();
        }
        self.metrics.push_back(metric);
    }

    /// 可被淘汰：已结束或隐式创建，且没有未落盘的记录
    fn evictable(&self) -> bool {
        (self.summary.is_some() || !self.explicit) && self.pending.is_empty()
    }

    fn take_pending(&mut self) -> Vec<Record> {
        self.pending_events = 0;
        self.pending_metrics = 0;
        std::mem::take(&mut self.pending)
    }

    fn summarize(&self, session_id: &str, ended_at: DateTime<Utc>) -> SessionSummary {
        let count = |t: EventType| self.events.iter().filter(|e| e.event_type == t).count();
        let steps_started = count(EventType::StepStarted);
        let steps_completed = count(EventType::StepCompleted);
        let steps_failed = count(EventType::StepFailed);
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        SessionSummary {
            session_id: session_id.to_string(),
            started_at: self.started_at,
            ended_at,
            duration_ms: (ended_at - self.started_at).num_milliseconds(),
            total_events: self.next_sequence as usize,
            total_metrics: self.metric_total,
            steps_started,
            steps_completed,
            steps_failed,
            step_completion_ratio: ratio(steps_completed, steps_started),
            error_count: self.events.iter().filter(|e| e.level >= EventLevel::Error).count(),
            warning_count: self
                .events
                .iter()
                .filter(|e| e.level == EventLevel::Warning)
                .count(),
            success_rate: ratio(steps_completed, steps_completed + steps_failed),
        }
    }
}

struct Inner {
    config: TelemetryConfig,
    sink: Option<Arc<dyn RecordSink>>,
    sessions: Mutex<HashMap<String, Session>>,
    /// 串行化落盘，保证同一会话的记录按顺序写入
    flush_lock: Mutex<()>,
    subscribers: StdRwLock<Vec<Arc<dyn AlertSubscriber>>>,
    stream: broadcast::Sender<DeploymentEvent>,
}

/// 部署遥测总线
#[derive(Clone)]
pub struct DeploymentTelemetry {
    inner: Arc<Inner>,
}

impl DeploymentTelemetry {
    pub fn new(config: TelemetryConfig, sink: Option<Arc<dyn RecordSink>>) -> Self {
        let (stream, _) = broadcast::channel(config.stream_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                sessions: Mutex::new(HashMap::new()),
                flush_lock: Mutex::new(()),
                subscribers: StdRwLock::new(Vec::new()),
                stream,
            }),
        }
    }

    /// 纯内存模式
    pub fn in_memory(config: TelemetryConfig) -> Self {
        Self::new(config, None)
    }

    pub fn has_sink(&self) -> bool {
        self.inner.sink.is_some()
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn AlertSubscriber>) {
        match self.inner.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    /// 实时事件流
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.inner.stream.subscribe()
    }

    /// 开始会话并记录配置快照
    pub async fn start_session(&self, session_id: &str, config: Value) -> DeploymentEvent {
        {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.contains_key(session_id) {
                warn!(session_id, "Telemetry session already started");
            } else {
                evict_ended(&mut sessions);
                let mut session = Session::new(true);
                if self.has_sink() {
                    session.pending.push(Record::ConfigSnapshot(ConfigSnapshot {
                        session_id: session_id.to_string(),
                        timestamp: Utc::now(),
                        config,
                    }));
                }
                sessions.insert(session_id.to_string(), session);
            }
        }
        info!(session_id, "Telemetry session started");
        self.log_event(
            session_id,
            EventType::SessionStarted,
            EventLevel::Info,
            "session started",
            Value::Null,
        )
        .await
    }

    /// 记录事件；未知会话会被隐式创建
    pub async fn log_event(
        &self,
        session_id: &str,
        event_type: EventType,
        level: EventLevel,
        message: impl Into<String>,
        details: Value,
    ) -> DeploymentEvent {
        let mut event = DeploymentEvent::new(session_id, event_type, level, message, details);
        let needs_flush = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = implicit_session(&mut sessions, session_id);
            event.sequence = session.next_sequence;
            session.next_sequence += 1;
            session.push_event(event.clone(), self.inner.config.retained_events);
            // 无存储时不保留待落盘缓冲
            if self.has_sink() {
                session.pending.push(Record::Event(event.clone()));
                session.pending_events += 1;
            }
            session.pending_events >= self.inner.config.event_buffer_size
        };

        // 没有订阅者时 send 返回错误，忽略
        let _ = self.inner.stream.send(event.clone());

        if level.is_alert() {
            self.notify(&event);
        }
        if needs_flush {
            self.flush_session(session_id).await;
        }
        event
    }

    /// 记录指标；超过阈值时生成 ThresholdExceeded 事件
    pub async fn record_metric(
        &self,
        session_id: &str,
        name: &str,
        value: f64,
        unit: &str,
    ) -> Option<DeploymentEvent> {
        let metric = PerformanceMetric {
            session_id: session_id.to_string(),
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: Utc::now(),
        };
        let needs_flush = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = implicit_session(&mut sessions, session_id);
            session.push_metric(metric.clone(), self.inner.config.retained_metrics);
            if self.has_sink() {
                session.pending.push(Record::Metric(metric));
                session.pending_metrics += 1;
            }
            session.pending_metrics >= self.inner.config.metric_buffer_size
        };

        let threshold = self.inner.config.thresholds.get(name).copied();
        let alert = match threshold.and_then(|t| t.evaluate(value).map(|level| (t, level))) {
            Some((t, level)) => {
                let limit = if level == EventLevel::Critical { t.critical } else { t.warning };
                Some(
                    self.log_event(
                        session_id,
                        EventType::ThresholdExceeded,
                        level,
                        format!("{} = {}{} exceeds {}", name, value, unit, limit),
                        json!({ "metric": name, "value": value, "unit": unit, "threshold": limit }),
                    )
                    .await,
                )
            }
            None => None,
        };

        if needs_flush {
            self.flush_session(session_id).await;
        }
        alert
    }

    /// 结束会话；摘要只计算一次，重复调用返回缓存结果
    pub async fn end_session(&self, session_id: &str) -> Option<SessionSummary> {
        {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(session_id) {
                None => return None,
                Some(session) if session.summary.is_some() => return session.summary.clone(),
                Some(_) => {}
            }
        }

        self.log_event(
            session_id,
            EventType::SessionEnded,
            EventLevel::Info,
            "session ended",
            Value::Null,
        )
        .await;

        let summary = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions.get_mut(session_id)?;
            if session.summary.is_none() {
                session.summary = Some(session.summarize(session_id, Utc::now()));
            }
            session.summary.clone()?
        };

        self.flush_session(session_id).await;
        info!(
            session_id,
            events = summary.total_events,
            errors = summary.error_count,
            duration_ms = summary.duration_ms,
            "Telemetry session ended"
        );
        Some(summary)
    }

    /// 将会话缓冲写入存储（无存储时缓冲始终为空）
    pub async fn flush_session(&self, session_id: &str) {
        let _guard = self.inner.flush_lock.lock().await;
        let records = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(session) => session.take_pending(),
                None => return,
            }
        };
        self.write(session_id, records).await;
    }

    pub async fn flush_all(&self) {
        let _guard = self.inner.flush_lock.lock().await;
        let batches: Vec<(String, Vec<Record>)> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions
                .iter_mut()
                .filter(|(_, s)| !s.pending.is_empty())
                .map(|(id, s)| (id.clone(), s.take_pending()))
                .collect()
        };
        for (session_id, records) in batches {
            self.write(&session_id, records).await;
        }
    }

    async fn write(&self, session_id: &str, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let Some(ref sink) = self.inner.sink else {
            return;
        };
        let count = records.len();
        match sink.insert_batch(records).await {
            Ok(()) => debug!(session_id, count, "Flushed telemetry records"),
            Err(e) => warn!(session_id, count, error = %e, "Failed to flush telemetry records"),
        }
    }

    /// 启动定时落盘任务
    pub fn start_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        this.flush_all().await;
                        break;
                    }
                    _ = ticker.tick() => this.flush_all().await,
                }
            }
            debug!("Telemetry flusher stopped");
        })
    }

    fn notify(&self, event: &DeploymentEvent) {
        let subscribers: Vec<Arc<dyn AlertSubscriber>> = match self.inner.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for subscriber in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_alert(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subscriber = subscriber.name(),
                    event_id = %event.id,
                    error = %e,
                    "Alert subscriber failed"
                ),
                Err(_) => warn!(
                    subscriber = subscriber.name(),
                    event_id = %event.id,
                    "Alert subscriber panicked"
                ),
            }
        }
    }

    // ========== 查询接口 ==========

    /// 会话列表（最新在前）
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.lock().await;
        let mut list: Vec<SessionInfo> = sessions.iter().map(|(id, s)| s.info(id)).collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.info(session_id))
    }

    /// 会话事件（按记录顺序）
    pub async fn get_events(&self, session_id: &str) -> Vec<DeploymentEvent> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_metrics(&self, session_id: &str) -> Vec<PerformanceMetric> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.metrics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .and_then(|s| s.summary.clone())
    }

    /// 查询已落盘记录
    pub async fn query_persisted(&self, filter: &RecordFilter) -> DeployResult<Vec<Record>> {
        match self.inner.sink {
            Some(ref sink) => Ok(sink.query(filter).await?),
            None => Ok(Vec::new()),
        }
    }
}

/// 取出会话；未知会话隐式创建（计入保留上限）
fn implicit_session<'a>(sessions: &'a mut HashMap<String, Session>, session_id: &str) -> &'a mut Session {
    if !sessions.contains_key(session_id) {
        debug!(session_id, "Implicitly creating telemetry session");
        evict_ended(sessions);
    }
    sessions
        .entry(session_id.to_string())
        .or_insert_with(|| Session::new(false))
}

/// 保持内存中的会话数有界：优先淘汰最早开始的可淘汰会话
fn evict_ended(sessions: &mut HashMap<String, Session>) {
    while sessions.len() >= MAX_RETAINED_SESSIONS {
        let oldest = sessions
            .iter()
            .filter(|(_, s)| s.evictable())
            .min_by_key(|(_, s)| s.started_at)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                sessions.remove(&id);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::persistence::{MemorySink, RecordType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(events: usize, metrics: usize) -> TelemetryConfig {
        TelemetryConfig {
            event_buffer_size: events,
            metric_buffer_size: metrics,
            ..TelemetryConfig::default()
        }
    }

    async fn info(t: &DeploymentTelemetry, session: &str, msg: String) {
        t.log_event(session, EventType::Custom, EventLevel::Info, msg, Value::Null)
            .await;
    }

    #[tokio::test]
    async fn test_interleaved_sessions_keep_order_without_leakage() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = DeploymentTelemetry::new(config(100, 50), Some(sink.clone()));
        telemetry.start_session("a", json!({})).await;
        telemetry.start_session("b", json!({})).await;

        let ta = telemetry.clone();
        let tb = telemetry.clone();
        let writer_a = tokio::spawn(async move {
            for i in 0..500 {
                info(&ta, "a", format!("a-{}", i)).await;
                tokio::task::yield_now().await;
            }
        });
        let writer_b = tokio::spawn(async move {
            for i in 0..500 {
                info(&tb, "b", format!("b-{}", i)).await;
                tokio::task::yield_now().await;
            }
        });
        writer_a.await.unwrap();
        writer_b.await.unwrap();

        for session in ["a", "b"] {
            let events = telemetry.get_events(session).await;
            assert_eq!(events.len(), 501);
            assert!(events.iter().all(|e| e.session_id == session));
            assert!(events.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
            let customs: Vec<&str> = events[1..].iter().map(|e| e.message.as_str()).collect();
            let expected: Vec<String> = (0..500).map(|i| format!("{}-{}", session, i)).collect();
            assert_eq!(customs, expected);
        }

        telemetry.end_session("a").await.unwrap();
        telemetry.end_session("b").await.unwrap();
        let persisted = sink
            .query(&RecordFilter {
                record_type: Some(RecordType::Event),
                session_id: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let seqs: Vec<u64> = persisted
            .iter()
            .filter_map(|r| match r {
                Record::Event(e) => Some(e.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..502).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_buffer_full_triggers_flush() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = DeploymentTelemetry::new(config(5, 50), Some(sink.clone()));
        telemetry.start_session("s", json!({"strategy": "auto-detect"})).await;
        assert_eq!(sink.len().await, 0);

        for i in 0..4 {
            info(&telemetry, "s", format!("e{}", i)).await;
        }
        // 快照 + 5 个事件
        assert_eq!(sink.len().await, 6);
    }

    #[tokio::test]
    async fn test_threshold_emits_synthetic_event() {
        let telemetry = DeploymentTelemetry::in_memory(config(100, 50));
        telemetry.start_session("s", Value::Null).await;

        assert!(telemetry.record_metric("s", "cpu_usage_percent", 50.0, "%").await.is_none());
        let warn = telemetry.record_metric("s", "cpu_usage_percent", 85.0, "%").await.unwrap();
        assert_eq!(warn.level, EventLevel::Warning);
        let crit = telemetry.record_metric("s", "cpu_usage_percent", 99.0, "%").await.unwrap();
        assert_eq!(crit.level, EventLevel::Critical);
        assert_eq!(crit.event_type, EventType::ThresholdExceeded);
        assert!(telemetry.record_metric("s", "unknown", 1e9, "").await.is_none());
        assert_eq!(telemetry.get_metrics("s").await.len(), 4);
    }

    #[tokio::test]
    async fn test_failing_subscribers_are_isolated() {
        let telemetry = DeploymentTelemetry::in_memory(config(100, 50));
        let delivered = Arc::new(AtomicUsize::new(0));

        telemetry.add_subscriber(Arc::new(FnSubscriber::new("err", |_| Err("smtp down".into()))));
        telemetry.add_subscriber(Arc::new(FnSubscriber::new("panic", |_| panic!("boom"))));
        let counter = delivered.clone();
        telemetry.add_subscriber(Arc::new(FnSubscriber::new("ok", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        telemetry
            .log_event("s", EventType::StepFailed, EventLevel::Error, "failed", Value::Null)
            .await;
        telemetry
            .log_event("s", EventType::Custom, EventLevel::Warning, "warn", Value::Null)
            .await;
        telemetry
            .log_event("s", EventType::Custom, EventLevel::Critical, "down", Value::Null)
            .await;

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(telemetry.get_events("s").await.len(), 3);
    }

    #[tokio::test]
    async fn test_summary_computed_once() {
        let telemetry = DeploymentTelemetry::in_memory(config(100, 50));
        telemetry.start_session("s", Value::Null).await;
        for (t, level) in [
            (EventType::StepStarted, EventLevel::Info),
            (EventType::StepCompleted, EventLevel::Info),
            (EventType::StepStarted, EventLevel::Info),
            (EventType::StepFailed, EventLevel::Error),
            (EventType::FallbackTriggered, EventLevel::Warning),
        ] {
            telemetry.log_event("s", t, level, "step", Value::Null).await;
        }

        let summary = telemetry.end_session("s").await.unwrap();
        assert_eq!(summary.steps_started, 2);
        assert_eq!(summary.step_completion_ratio, 0.5);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.warning_count, 1);
        assert_eq!(summary.total_events, 7);

        info(&telemetry, "s", "late".into()).await;
        let again = telemetry.end_session("s").await.unwrap();
        assert_eq!(again, summary);
        assert!(telemetry.end_session("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_retained_records_are_capped_per_session() {
        let mut cfg = config(100, 50);
        cfg.retained_events = 10;
        cfg.retained_metrics = 5;
        let telemetry = DeploymentTelemetry::in_memory(cfg);
        telemetry.start_session("s", Value::Null).await;
        telemetry.end_session("s").await.unwrap();

        // 会话结束后健康检查仍持续写入
        for i in 0..40 {
            info(&telemetry, "s", format!("late-{}", i)).await;
            telemetry.record_metric("s", "health_check_latency_ms", 10.0, "ms").await;
        }

        let events = telemetry.get_events("s").await;
        assert_eq!(events.len(), 10);
        assert_eq!(events.last().unwrap().message, "late-39");
        assert!(events.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
        assert_eq!(telemetry.get_metrics("s").await.len(), 5);

        let session = telemetry.session("s").await.unwrap();
        assert_eq!(session.event_count, 42);
        assert_eq!(session.metric_count, 40);
    }

    #[tokio::test]
    async fn test_implicit_sessions_count_toward_retention() {
        let telemetry = DeploymentTelemetry::in_memory(config(100, 50));
        telemetry.start_session("live", Value::Null).await;

        for i in 0..(MAX_RETAINED_SESSIONS * 2) {
            info(&telemetry, &format!("implicit-{}", i), "tick".into()).await;
        }

        let sessions = telemetry.sessions().await;
        assert!(sessions.len() <= MAX_RETAINED_SESSIONS);
        assert!(telemetry.session("live").await.is_some());
        assert!(telemetry
            .session(&format!("implicit-{}", MAX_RETAINED_SESSIONS * 2 - 1))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let telemetry = DeploymentTelemetry::in_memory(config(100, 50));
        let mut rx = telemetry.subscribe();
        telemetry.start_session("s", Value::Null).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::SessionStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flusher() {
        let sink = Arc::new(MemorySink::new());
        let mut cfg = config(100, 50);
        cfg.flush_interval = Duration::from_secs(30);
        let telemetry = DeploymentTelemetry::new(cfg, Some(sink.clone()));
        let cancel = CancellationToken::new();
        let handle = telemetry.start_flusher(cancel.clone());

        telemetry.start_session("s", Value::Null).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.len().await, 2);

        info(&telemetry, "s", "after".into()).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(sink.len().await, 3);
    }
}
