//! 处理监控（ProcessingMonitor）
//!
//! 记录每次投递尝试的生命周期：`Started` 只会转入一个终态
//! （`Succeeded` / `Failed` / `TimedOut`），由从活动表移除的一方完成，
//! 因此并发的完成与超时扫描只有一方生效。
//!
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, warn};

use super::ratio;

pub type AttemptId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Started,
    Succeeded,
    Failed,
    TimedOut,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessingState::Started)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessingRecord {
    pub attempt_id: AttemptId,
    pub event_id: String,
    pub handler_name: String,
    pub started_at: DateTime<Utc>,
    pub state: ProcessingState,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProcessingRecord {
    /// 从开始到完成（或到现在）的耗时
    pub fn elapsed(&self) -> TimeDelta {
        self.completed_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.started_at)
    }
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// 终态记录的历史保留条数
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProcessingStatistics {
    pub total_started: u64,
    pub total_processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub permanently_failed: u64,
    pub currently_active: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub timeout_rate: f64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    permanently_failed: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.started,
            &self.succeeded,
            &self.failed,
            &self.timed_out,
            &self.permanently_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct ProcessingMonitor {
    config: MonitorConfig,
    next_id: AtomicU64,
    active: DashMap<AttemptId, ProcessingRecord>,
    history: Mutex<VecDeque<ProcessingRecord>>,
    counters: Counters,
}

impl Default for ProcessingMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ProcessingMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    pub fn record_start(&self, event_id: &str, handler_name: &str) -> AttemptId {
        self.record_start_with(event_id, handler_name, |_| {})
    }

    /// 同 [`record_start`](Self::record_start)，在记录对超时扫描可见之前先调用 `before_active`
    pub fn record_start_with(
        &self,
        event_id: &str,
        handler_name: &str,
        before_active: impl FnOnce(AttemptId),
    ) -> AttemptId {
        let attempt_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        before_active(attempt_id);
        self.active.insert(
            attempt_id,
            ProcessingRecord {
                attempt_id,
                event_id: event_id.to_string(),
                handler_name: handler_name.to_string(),
                started_at: Utc::now(),
                state: ProcessingState::Started,
                completed_at: None,
                error: None,
            },
        );
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        attempt_id
    }

    pub fn record_success(&self, attempt_id: AttemptId) -> bool {
        self.complete(attempt_id, ProcessingState::Succeeded, None)
            .is_some()
    }

    pub fn record_failure(&self, attempt_id: AttemptId, error: &str) -> bool {
        self.complete(attempt_id, ProcessingState::Failed, Some(error.to_string()))
            .is_some()
    }

    pub fn record_timeout(&self, attempt_id: AttemptId, error: &str) -> bool {
        self.complete(attempt_id, ProcessingState::TimedOut, Some(error.to_string()))
            .is_some()
    }

    fn complete(
        &self,
        attempt_id: AttemptId,
        state: ProcessingState,
        error: Option<String>,
    ) -> Option<ProcessingRecord> {
        if !state.is_terminal() {
            return None;
        }
        let (_, mut record) = self.active.remove(&attempt_id)?;
        record.state = state;
        record.completed_at = Some(Utc::now());
        record.error = error;

        let counter = match state {
            ProcessingState::Succeeded => &self.counters.succeeded,
            ProcessingState::Failed => &self.counters.failed,
            ProcessingState::TimedOut | ProcessingState::Started => &self.counters.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.push_history(record.clone());
        Some(record)
    }

    fn push_history(&self, record: ProcessingRecord) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// 将运行超过 `timeout` 的尝试标记为超时并返回
    pub fn check_for_timeouts(&self, timeout: Duration) -> Vec<ProcessingRecord> {
        let now = Utc::now();
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);

        let overdue: Vec<AttemptId> = self
            .active
            .iter()
            .filter(|r| now.signed_duration_since(r.started_at) >= timeout)
            .map(|r| *r.key())
            .collect();

        let reason = format!("processing exceeded {}ms", timeout.num_milliseconds());
        let timed_out: Vec<ProcessingRecord> = overdue
            .into_iter()
            .filter_map(|id| self.complete(id, ProcessingState::TimedOut, Some(reason.clone())))
            .collect();

        for record in &timed_out {
            warn!(
                attempt_id = record.attempt_id,
                event_id = %record.event_id,
                handler = %record.handler_name,
                elapsed_ms = record.elapsed().num_milliseconds(),
                "processing timed out"
            );
        }
        timed_out
    }

    pub fn record_permanent_failure(&self, event_id: &str, handler_name: &str, error: &str) {
        self.counters
            .permanently_failed
            .fetch_add(1, Ordering::Relaxed);
        error!(
            event_id = %event_id,
            handler = %handler_name,
            error = %error,
            "event permanently failed"
        );
    }

    pub fn is_active(&self, attempt_id: AttemptId) -> bool {
        self.active.contains_key(&attempt_id)
    }

    pub fn statistics(&self) -> ProcessingStatistics {
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let timed_out = self.counters.timed_out.load(Ordering::Relaxed);
        let processed = succeeded + failed + timed_out;

        ProcessingStatistics {
            total_started: self.counters.started.load(Ordering::Relaxed),
            total_processed: processed,
            succeeded,
            failed,
            timed_out,
            permanently_failed: self.counters.permanently_failed.load(Ordering::Relaxed),
            currently_active: self.active.len(),
            success_rate: ratio(succeeded, processed),
            failure_rate: ratio(failed, processed),
            timeout_rate: ratio(timed_out, processed),
        }
    }

    /// 清零计数与历史；进行中的尝试保留
    pub fn reset_statistics(&self) {
        self.counters.reset();
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn recent_records(&self) -> Vec<ProcessingRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_happens_once() {
        let m = ProcessingMonitor::default();
        let id = m.record_start("e-1", "inventory");
        assert!(m.is_active(id));

        assert!(m.record_success(id));
        assert!(!m.record_failure(id, "late"));
        assert!(!m.record_timeout(id, "late"));

        let stats = m.statistics();
        assert_eq!(stats.total_started, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.currently_active, 0);
        assert_eq!(m.recent_records()[0].state, ProcessingState::Succeeded);
    }

    #[test]
    fn rates_are_zero_without_processing() {
        let m = ProcessingMonitor::default();
        m.record_start("e-1", "inventory");
        let stats = m.statistics();
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.failure_rate, 0.0);
        assert_eq!(stats.timeout_rate, 0.0);
    }

    #[test]
    fn statistics_aggregate_outcomes() {
        let m = ProcessingMonitor::default();
        let a = m.record_start("e-1", "h");
        let b = m.record_start("e-2", "h");
        let c = m.record_start("e-3", "h");
        let d = m.record_start("e-4", "h");
        m.record_success(a);
        m.record_success(b);
        m.record_failure(c, "boom");
        m.record_timeout(d, "slow");
        m.record_permanent_failure("e-3", "h", "boom");

        let stats = m.statistics();
        assert_eq!(stats.total_processed, 4);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.failure_rate, 0.25);
        assert_eq!(stats.timeout_rate, 0.25);
        assert_eq!(stats.permanently_failed, 1);
    }

    #[test]
    fn timeout_scan_completes_overdue_attempts() {
        let m = ProcessingMonitor::default();
        let id = m.record_start("e-1", "slow");

        let timed_out = m.check_for_timeouts(Duration::ZERO);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].attempt_id, id);
        assert_eq!(timed_out[0].state, ProcessingState::TimedOut);

        // 超时之后的迟到完成不再生效
        assert!(!m.record_success(id));
        assert_eq!(m.statistics().timed_out, 1);
        assert_eq!(m.statistics().succeeded, 0);
        assert!(m.check_for_timeouts(Duration::ZERO).is_empty());
    }

    #[test]
    fn recent_attempts_are_not_timed_out() {
        let m = ProcessingMonitor::default();
        m.record_start("e-1", "h");
        assert!(m.check_for_timeouts(Duration::from_secs(60)).is_empty());
        assert_eq!(m.statistics().currently_active, 1);
    }

    #[test]
    fn history_is_bounded_and_resettable() {
        let m = ProcessingMonitor::new(MonitorConfig {
            history_capacity: 2,
        });
        for i in 0..3 {
            let id = m.record_start(&format!("e-{i}"), "h");
            m.record_success(id);
        }
        let events: Vec<String> = m.recent_records().into_iter().map(|r| r.event_id).collect();
        assert_eq!(events, vec!["e-1", "e-2"]);

        m.reset_statistics();
        assert!(m.recent_records().is_empty());
        assert_eq!(m.statistics(), ProcessingStatistics::default());
    }
}
