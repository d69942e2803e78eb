//! 可靠投递器（ResilientDispatcher）
//!
//! 单次投递的编排入口：
//! 1. 背压准入（拒绝时不触碰序号跟踪与监控）；
//! 2. 序号校验（重复直接确认，乱序按策略缓冲或放行）；
//! 3. 记录开始，在超时保护下调用处理器（panic 视为失败）；
//! 4. 成功则清除重试上下文；失败/超时则安排重试，次数耗尽转为死信。
//!
//! 有效事件处理后，会按序重放缺口已补齐的缓冲事件。
//! 处理器失败不会向调用方抛出，只体现在 `DispatchOutcome` 与统计中。
//!
use super::backpressure::{BackpressureLevel, BackpressureManager, BackpressureStatus, InFlightPermit};
use super::monitor::{AttemptId, ProcessingMonitor, ProcessingStatistics};
use super::retry::{DeadLetter, RetryDecision, RetryKey, RetryManager, RetryStatistics};
use super::sequence::{OutOfOrderDisposition, SequenceCheck, SequenceStatistics, SequenceTracker};
use super::EventHandler;
use crate::domain_event::EventEnvelope;
use crate::error::{DomainError, DomainResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 单次投递的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    /// 处理器执行成功
    Accepted,
    /// 背压拒绝，调用方稍后重投；不计为失败
    RejectedBackpressure,
    /// 已处理过的序号，处理器未被调用
    Duplicate,
    /// 乱序事件已缓冲，缺口补齐后自动重放
    Buffered,
    /// 处理失败，已安排重试
    FailedScheduledRetry,
    /// 重试耗尽，已转为死信
    FailedTerminal,
}

impl DispatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::FailedScheduledRetry | DispatchOutcome::FailedTerminal
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandlerOutcome {
    pub handler_name: String,
    pub outcome: DispatchOutcome,
}

impl HandlerOutcome {
    fn new(handler: &Arc<dyn EventHandler>, outcome: DispatchOutcome) -> Self {
        Self {
            handler_name: handler.handler_name().to_string(),
            outcome,
        }
    }
}

/// 健康度各项权重与阈值
#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub processing_weight: f64,
    pub retry_weight: f64,
    pub backpressure_weight: f64,
    pub sequence_weight: f64,
    /// 活跃重试数达到该值时重试负载记为满
    pub retry_load_ceiling: usize,
    /// 低于该分数视为不健康
    pub healthy_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            processing_weight: 0.4,
            retry_weight: 0.2,
            backpressure_weight: 0.2,
            sequence_weight: 0.2,
            retry_load_ceiling: 100,
            healthy_threshold: 0.7,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// 单次处理器调用的超时；`None` 表示只依赖周期性超时扫描
    pub handler_timeout: Option<Duration>,
    /// 超时扫描认定的处理时长上限
    pub processing_timeout: Duration,
    /// 同一事件多个处理器的并发度
    pub handler_concurrency: usize,
    /// 一次轮询中并发重投的上限
    pub retry_concurrency: usize,
    pub health: HealthConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Some(Duration::from_secs(30)),
            processing_timeout: Duration::from_secs(30),
            handler_concurrency: 8,
            retry_concurrency: 16,
            health: HealthConfig::default(),
        }
    }
}

/// 系统健康度快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemHealth {
    /// 0.0 ~ 1.0
    pub score: f64,
    pub healthy: bool,
    pub processing_success_rate: f64,
    pub retry_load: f64,
    pub backpressure_level: BackpressureLevel,
    pub sequence_valid_rate: f64,
    pub checked_at: DateTime<Utc>,
}

struct InFlightAttempt {
    envelope: EventEnvelope,
    handler: Arc<dyn EventHandler>,
}

enum Admission<'a> {
    Proceed(InFlightPermit<'a>, SequenceCheck),
    Settled(DispatchOutcome),
}

/// 可靠投递器；各组件以 `Arc` 注入，便于共享与测试
#[derive(Builder)]
pub struct ResilientDispatcher {
    #[builder(default)]
    sequence_tracker: Arc<SequenceTracker>,
    #[builder(default)]
    backpressure: Arc<BackpressureManager>,
    #[builder(default)]
    retry_manager: Arc<RetryManager>,
    #[builder(default)]
    monitor: Arc<ProcessingMonitor>,
    #[builder(default)]
    config: DispatcherConfig,
    // 进行中的尝试，超时扫描据此安排重试
    #[builder(skip)]
    in_flight: DashMap<AttemptId, InFlightAttempt>,
    // 被缓冲事件的处理器，按 event_id 暂存到重放
    #[builder(skip)]
    parked: DashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl Default for ResilientDispatcher {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ResilientDispatcher {
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 将事件投递给单个处理器
    pub async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        handler: Arc<dyn EventHandler>,
    ) -> DispatchOutcome {
        match self.admit(envelope, std::slice::from_ref(&handler)) {
            Admission::Settled(outcome) => outcome,
            Admission::Proceed(permit, check) => {
                let outcome = self.execute(envelope, &handler).await;
                if check == SequenceCheck::Valid {
                    self.replay_ready(envelope.aggregate_id()).await;
                }
                drop(permit);
                outcome
            }
        }
    }

    /// 将事件投递给多个处理器：一次准入、一次序号校验，各处理器独立计数与重试
    pub async fn dispatch_all(
        &self,
        envelope: &EventEnvelope,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Vec<HandlerOutcome> {
        if handlers.is_empty() {
            return Vec::new();
        }

        match self.admit(envelope, &handlers) {
            Admission::Settled(outcome) => handlers
                .iter()
                .map(|h| HandlerOutcome::new(h, outcome))
                .collect(),
            Admission::Proceed(permit, check) => {
                let outcomes = self.execute_all(envelope, &handlers).await;
                if check == SequenceCheck::Valid {
                    self.replay_ready(envelope.aggregate_id()).await;
                }
                drop(permit);
                outcomes
            }
        }
    }

    fn admit(&self, envelope: &EventEnvelope, handlers: &[Arc<dyn EventHandler>]) -> Admission<'_> {
        let Some(permit) = self.backpressure.try_acquire() else {
            debug!(
                event_id = %envelope.event_id(),
                aggregate_id = %envelope.aggregate_id(),
                "dispatch rejected by backpressure"
            );
            return Admission::Settled(DispatchOutcome::RejectedBackpressure);
        };

        let check = self.sequence_tracker.validate_with(envelope, |buffered| {
            self.parked
                .entry(buffered.event_id().to_string())
                .or_default()
                .extend(handlers.iter().cloned());
        });

        match check {
            SequenceCheck::Valid => Admission::Proceed(permit, check),
            SequenceCheck::Duplicate => {
                debug!(
                    event_id = %envelope.event_id(),
                    aggregate_id = %envelope.aggregate_id(),
                    sequence = envelope.sequence(),
                    "duplicate event acknowledged"
                );
                Admission::Settled(DispatchOutcome::Duplicate)
            }
            SequenceCheck::OutOfOrder {
                expected,
                disposition: OutOfOrderDisposition::Buffered,
            } => {
                info!(
                    event_id = %envelope.event_id(),
                    aggregate_id = %envelope.aggregate_id(),
                    sequence = envelope.sequence(),
                    expected,
                    "out-of-order event buffered"
                );
                Admission::Settled(DispatchOutcome::Buffered)
            }
            SequenceCheck::OutOfOrder {
                expected,
                disposition: OutOfOrderDisposition::Accepted,
            } => {
                warn!(
                    event_id = %envelope.event_id(),
                    aggregate_id = %envelope.aggregate_id(),
                    sequence = envelope.sequence(),
                    expected,
                    "out-of-order event accepted with a gap"
                );
                Admission::Proceed(permit, check)
            }
        }
    }

    async fn execute_all(
        &self,
        envelope: &EventEnvelope,
        handlers: &[Arc<dyn EventHandler>],
    ) -> Vec<HandlerOutcome> {
        let calls: Vec<BoxFuture<'_, HandlerOutcome>> = handlers
            .iter()
            .map(|handler| {
                async move { HandlerOutcome::new(handler, self.execute(envelope, handler).await) }
                    .boxed()
            })
            .collect();

        stream::iter(calls)
            .buffered(self.config.handler_concurrency.max(1))
            .collect()
            .await
    }

    // 依次重放缺口已补齐的缓冲事件，复用当前的在途名额；取出的事件已判定有效
    async fn replay_ready(&self, aggregate_id: &str) {
        while let Some(next) = self.sequence_tracker.take_ready(aggregate_id) {
            let handlers = self
                .parked
                .remove(next.event_id())
                .map(|(_, handlers)| handlers)
                .unwrap_or_default();

            debug!(
                event_id = %next.event_id(),
                aggregate_id = %aggregate_id,
                sequence = next.sequence(),
                handlers = handlers.len(),
                "replaying buffered event"
            );
            self.execute_all(&next, &handlers).await;
        }
    }

    async fn execute(&self, envelope: &EventEnvelope, handler: &Arc<dyn EventHandler>) -> DispatchOutcome {
        let handler_name = handler.handler_name();
        let attempt_id = self
            .monitor
            .record_start_with(envelope.event_id(), handler_name, |attempt_id| {
                self.in_flight.insert(
                    attempt_id,
                    InFlightAttempt {
                        envelope: envelope.clone(),
                        handler: handler.clone(),
                    },
                );
            });

        let result = self.invoke(envelope, handler).await;
        // 谁摘除在途记录，谁负责为失败安排重试（与超时扫描互斥）
        let owned = self.in_flight.remove(&attempt_id).is_some();
        let key = RetryKey::new(envelope.event_id(), handler_name);

        match result {
            Ok(()) => {
                if !self.monitor.record_success(attempt_id) {
                    debug!(
                        attempt_id,
                        event_id = %envelope.event_id(),
                        handler = %handler_name,
                        "handler completed after it was marked timed out"
                    );
                }
                self.retry_manager.clear(&key);
                DispatchOutcome::Accepted
            }
            Err(err) => {
                let reason = err.to_string();
                let recorded = match err {
                    DomainError::HandlerTimeout { .. } => {
                        self.monitor.record_timeout(attempt_id, &reason)
                    }
                    _ => self.monitor.record_failure(attempt_id, &reason),
                };

                if recorded || owned {
                    self.schedule_retry(envelope, handler, &reason)
                } else if self.retry_manager.is_pending(&key) {
                    // 超时扫描已接管并安排了重试
                    DispatchOutcome::FailedScheduledRetry
                } else {
                    // 超时扫描已接管，且重试已耗尽转为死信
                    DispatchOutcome::FailedTerminal
                }
            }
        }
    }

    async fn invoke(&self, envelope: &EventEnvelope, handler: &Arc<dyn EventHandler>) -> DomainResult<()> {
        let name = handler.handler_name();
        let call = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();

        let result = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DomainError::HandlerTimeout {
                        handler: name.to_string(),
                        timeout_ms: limit.as_millis(),
                    });
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DomainError::EventHandler {
                handler: name.to_string(),
                reason: format!("{err:#}"),
            }),
            Err(panic) => Err(DomainError::HandlerPanicked {
                handler: name.to_string(),
                reason: panic_message(&*panic),
            }),
        }
    }

    fn schedule_retry(
        &self,
        envelope: &EventEnvelope,
        handler: &Arc<dyn EventHandler>,
        reason: &str,
    ) -> DispatchOutcome {
        match self.retry_manager.schedule_retry(envelope, handler, reason) {
            RetryDecision::Scheduled(_) => DispatchOutcome::FailedScheduledRetry,
            RetryDecision::Exhausted(ctx) => {
                self.monitor.record_permanent_failure(
                    envelope.event_id(),
                    handler.handler_name(),
                    ctx.last_error(),
                );
                DispatchOutcome::FailedTerminal
            }
        }
    }

    /// 重投所有到期的重试；被背压拒绝的上下文退回，不消耗次数。返回实际重投数
    pub async fn process_due_retries(&self) -> usize {
        let due = self.retry_manager.due_for_retry(Utc::now());
        if due.is_empty() {
            return 0;
        }

        self.backpressure.enqueue(due.len());
        let dispatched = AtomicUsize::new(0);
        let dispatched_ref = &dispatched;

        stream::iter(due)
            .for_each_concurrent(Some(self.config.retry_concurrency.max(1)), |ctx| async move {
                self.backpressure.dequeue(1);
                let key = ctx.key();

                let Some(permit) = self.backpressure.try_acquire() else {
                    debug!(key = %key, "retry deferred by backpressure");
                    self.retry_manager.release(&key);
                    return;
                };

                self.retry_manager.record_retry_attempt(&key);
                self.execute(ctx.envelope(), ctx.handler()).await;
                drop(permit);
                dispatched_ref.fetch_add(1, Ordering::Relaxed);
            })
            .await;

        dispatched.into_inner()
    }

    /// 超时扫描：超时的尝试按失败处理并安排重试。返回超时数量
    pub fn check_for_timeouts(&self) -> usize {
        let timed_out = self.monitor.check_for_timeouts(self.config.processing_timeout);

        for record in &timed_out {
            let Some((_, attempt)) = self.in_flight.remove(&record.attempt_id) else {
                continue;
            };
            let reason = record
                .error
                .clone()
                .unwrap_or_else(|| "processing timed out".to_string());
            self.schedule_retry(&attempt.envelope, &attempt.handler, &reason);
        }

        timed_out.len()
    }

    /// 清理过期的重试上下文，返回清理数量
    pub fn cleanup_retry_contexts(&self) -> usize {
        self.retry_manager.cleanup_expired_contexts()
    }

    /// 清理过期的聚合序号记录；其中仍在缓冲的事件直接投递，不会丢弃
    pub async fn cleanup_sequence_records(&self) -> usize {
        let cleanup = self.sequence_tracker.cleanup_expired_records();

        for envelope in cleanup.flushed {
            let Some((_, handlers)) = self.parked.remove(envelope.event_id()) else {
                continue;
            };
            self.execute_all(&envelope, &handlers).await;
        }

        cleanup.removed_records
    }

    pub fn log_statistics(&self) {
        let processing = self.monitor.statistics();
        let retry = self.retry_manager.statistics();
        let backpressure = self.backpressure.status();
        let sequence = self.sequence_tracker.statistics();
        let health = self.system_health();

        info!(
            processed = processing.total_processed,
            succeeded = processing.succeeded,
            failed = processing.failed,
            timed_out = processing.timed_out,
            permanently_failed = processing.permanently_failed,
            active = processing.currently_active,
            active_retries = retry.active_retries,
            retry_attempts = retry.total_retry_attempts,
            dead_letters = retry.dead_letters,
            backpressure = ?backpressure.level,
            in_flight = backpressure.current_concurrent_events,
            tracked_aggregates = sequence.tracked_aggregates,
            buffered = sequence.buffered_events,
            duplicates = sequence.duplicate_events,
            health = health.score,
            healthy = health.healthy,
            "event delivery statistics"
        );
    }

    pub fn processing_statistics(&self) -> ProcessingStatistics {
        self.monitor.statistics()
    }

    pub fn retry_statistics(&self) -> RetryStatistics {
        self.retry_manager.statistics()
    }

    pub fn backpressure_status(&self) -> BackpressureStatus {
        self.backpressure.status()
    }

    pub fn sequence_statistics(&self) -> SequenceStatistics {
        self.sequence_tracker.statistics()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.retry_manager.dead_letters()
    }

    /// 加权健康度：处理成功率、重试负载、背压级别与序号有效率
    pub fn system_health(&self) -> SystemHealth {
        let weights = &self.config.health;
        let processing = self.monitor.statistics();
        let retry = self.retry_manager.statistics();
        let level = self.backpressure.status().level;
        let sequence = self.sequence_tracker.statistics();

        let processing_score = if processing.total_processed == 0 {
            1.0
        } else {
            processing.success_rate
        };
        let retry_load =
            (retry.active_retries as f64 / weights.retry_load_ceiling.max(1) as f64).min(1.0);
        let sequence_total =
            sequence.valid_events + sequence.duplicate_events + sequence.out_of_order_events;
        let sequence_score = if sequence_total == 0 {
            1.0
        } else {
            sequence.valid_rate
        };

        let total_weight = weights.processing_weight
            + weights.retry_weight
            + weights.backpressure_weight
            + weights.sequence_weight;
        let weighted = processing_score * weights.processing_weight
            + (1.0 - retry_load) * weights.retry_weight
            + level.health_score() * weights.backpressure_weight
            + sequence_score * weights.sequence_weight;
        let score = if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        SystemHealth {
            score,
            healthy: score >= weights.healthy_threshold,
            processing_success_rate: processing.success_rate,
            retry_load,
            backpressure_level: level,
            sequence_valid_rate: sequence.valid_rate,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.system_health().healthy
    }

    pub fn reset_processing_statistics(&self) {
        self.monitor.reset_statistics();
        info!("processing statistics reset");
    }

    /// 重置聚合序号；被丢弃的缓冲事件一并返回
    pub fn reset_aggregate_sequence(&self, aggregate_id: &str) -> Vec<EventEnvelope> {
        let discarded = self.sequence_tracker.reset_sequence(aggregate_id);
        self.unpark(aggregate_id, &discarded);
        discarded
    }

    /// 强制设置聚合序号，随后重放因此变为就绪的缓冲事件
    pub async fn force_update_sequence(&self, aggregate_id: &str, sequence: u64) -> Vec<EventEnvelope> {
        let discarded = self.sequence_tracker.force_update_sequence(aggregate_id, sequence);
        self.unpark(aggregate_id, &discarded);
        self.replay_ready(aggregate_id).await;
        discarded
    }

    pub fn current_sequence(&self, aggregate_id: &str) -> Option<u64> {
        self.sequence_tracker.current_sequence(aggregate_id)
    }

    fn unpark(&self, aggregate_id: &str, discarded: &[EventEnvelope]) {
        for envelope in discarded {
            self.parked.remove(envelope.event_id());
            warn!(
                event_id = %envelope.event_id(),
                aggregate_id = %aggregate_id,
                sequence = envelope.sequence(),
                "buffered event discarded by operator action"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventing::backpressure::BackpressureConfig;
    use crate::eventing::retry::RetryConfig;
    use crate::eventing::sequence::{OutOfOrderPolicy, SequenceTrackerConfig};
    use crate::eventing::{HandledEventType, handler_fn};
    use std::sync::Mutex;

    fn event(aggregate_id: &str, sequence: u64) -> EventEnvelope {
        EventEnvelope::builder()
            .event_id(format!("{aggregate_id}-{sequence}"))
            .aggregate_id(aggregate_id)
            .sequence(sequence)
            .event_type("OrderEvent")
            .build()
    }

    fn recorder(name: &str, log: Arc<Mutex<Vec<u64>>>) -> Arc<dyn EventHandler> {
        handler_fn(name.to_string(), HandledEventType::All, move |event| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(event.sequence());
                Ok(())
            }
        })
    }

    fn immediate_retries(max_attempts: u32) -> Arc<RetryManager> {
        Arc::new(RetryManager::new(RetryConfig {
            max_attempts,
            initial_delay: Duration::ZERO,
            jitter_factor: 0.0,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn order_events_accepted_then_duplicate() {
        let dispatcher = ResilientDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("audit", log.clone());

        let outcomes = vec![
            dispatcher.dispatch(&event("order-1", 1), handler.clone()).await,
            dispatcher.dispatch(&event("order-1", 2), handler.clone()).await,
            dispatcher.dispatch(&event("order-1", 2), handler.clone()).await,
        ];

        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Accepted,
                DispatchOutcome::Accepted,
                DispatchOutcome::Duplicate
            ]
        );
        assert_eq!(dispatcher.current_sequence("order-1"), Some(2));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(dispatcher.processing_statistics().total_started, 2);
    }

    #[tokio::test]
    async fn buffered_events_replay_after_gap_fills() {
        let dispatcher = ResilientDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("audit", log.clone());

        assert_eq!(
            dispatcher.dispatch(&event("a", 1), handler.clone()).await,
            DispatchOutcome::Accepted
        );
        assert_eq!(
            dispatcher.dispatch(&event("a", 3), handler.clone()).await,
            DispatchOutcome::Buffered
        );
        assert_eq!(
            dispatcher.dispatch(&event("a", 4), handler.clone()).await,
            DispatchOutcome::Buffered
        );
        assert_eq!(*log.lock().unwrap(), vec![1]);

        assert_eq!(
            dispatcher.dispatch(&event("a", 2), handler.clone()).await,
            DispatchOutcome::Accepted
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(dispatcher.current_sequence("a"), Some(4));
        assert_eq!(dispatcher.sequence_statistics().buffered_events, 0);
    }

    #[tokio::test]
    async fn redelivered_buffered_event_is_replayed_once() {
        let dispatcher = ResilientDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("audit", log.clone());

        dispatcher.dispatch(&event("a", 1), handler.clone()).await;
        assert_eq!(
            dispatcher.dispatch(&event("a", 3), handler.clone()).await,
            DispatchOutcome::Buffered
        );
        assert_eq!(
            dispatcher.dispatch(&event("a", 3), handler.clone()).await,
            DispatchOutcome::Duplicate
        );
        dispatcher.dispatch(&event("a", 2), handler.clone()).await;
        assert_eq!(
            dispatcher.dispatch(&event("a", 3), handler.clone()).await,
            DispatchOutcome::Duplicate
        );

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        let stats = dispatcher.sequence_statistics();
        assert_eq!(stats.valid_events, 3);
        assert_eq!(stats.duplicate_events, 2);
    }

    #[tokio::test]
    async fn accept_policy_delivers_immediately() {
        let dispatcher = ResilientDispatcher::builder()
            .sequence_tracker(Arc::new(SequenceTracker::new(SequenceTrackerConfig {
                out_of_order_policy: OutOfOrderPolicy::AcceptWithWarning,
                ..Default::default()
            })))
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("audit", log.clone());

        dispatcher.dispatch(&event("a", 1), handler.clone()).await;
        assert_eq!(
            dispatcher.dispatch(&event("a", 3), handler.clone()).await,
            DispatchOutcome::Accepted
        );
        assert_eq!(
            dispatcher.dispatch(&event("a", 2), handler.clone()).await,
            DispatchOutcome::Accepted
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 3, 2]);
        assert_eq!(dispatcher.current_sequence("a"), Some(3));
    }

    #[tokio::test]
    async fn failure_then_recovery_through_retry_poll() {
        let dispatcher = ResilientDispatcher::builder()
            .retry_manager(immediate_retries(3))
            .build();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let flaky = handler_fn("flaky", HandledEventType::All, move |_| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("downstream unavailable");
                }
                Ok(())
            }
        });

        assert_eq!(
            dispatcher.dispatch(&event("a", 1), flaky).await,
            DispatchOutcome::FailedScheduledRetry
        );
        assert_eq!(dispatcher.process_due_retries().await, 1);
        assert_eq!(dispatcher.process_due_retries().await, 1);
        assert_eq!(dispatcher.process_due_retries().await, 0);

        let processing = dispatcher.processing_statistics();
        assert_eq!(processing.succeeded, 1);
        assert_eq!(processing.failed, 2);
        let retry = dispatcher.retry_statistics();
        assert_eq!(retry.total_retry_attempts, 2);
        assert_eq!(retry.active_retries, 0);
        assert_eq!(retry.recovered, 1);
    }

    #[tokio::test]
    async fn panics_are_failures() {
        let dispatcher = ResilientDispatcher::builder()
            .retry_manager(immediate_retries(1))
            .build();
        let handler = handler_fn("panicky", HandledEventType::All, |event| async move {
            if event.sequence() > 0 {
                panic!("boom");
            }
            Ok(())
        });

        assert_eq!(
            dispatcher.dispatch(&event("a", 1), handler).await,
            DispatchOutcome::FailedTerminal
        );
        let letters = dispatcher.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].last_error.contains("boom"), "{}", letters[0].last_error);
        assert_eq!(dispatcher.processing_statistics().permanently_failed, 1);
    }

    #[tokio::test]
    async fn handler_timeout_counts_separately() {
        let dispatcher = ResilientDispatcher::builder()
            .retry_manager(immediate_retries(3))
            .config(DispatcherConfig {
                handler_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            })
            .build();
        let slow = handler_fn("slow", HandledEventType::All, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        assert_eq!(
            dispatcher.dispatch(&event("a", 1), slow).await,
            DispatchOutcome::FailedScheduledRetry
        );
        let stats = dispatcher.processing_statistics();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 0);
        assert!(dispatcher.retry_manager.is_pending(&RetryKey::new("a-1", "slow")));
    }

    fn gated_failure(gate: Arc<tokio::sync::Semaphore>) -> Arc<dyn EventHandler> {
        handler_fn("gated", HandledEventType::All, move |_| {
            let gate = gate.clone();
            async move {
                let _ = gate.acquire().await;
                Err(anyhow::anyhow!("downstream rejected"))
            }
        })
    }

    fn untimed(retries: Arc<RetryManager>) -> ResilientDispatcher {
        ResilientDispatcher::builder()
            .retry_manager(retries)
            .config(DispatcherConfig {
                handler_timeout: None,
                processing_timeout: Duration::ZERO,
                ..Default::default()
            })
            .build()
    }

    async fn until_active(dispatcher: &ResilientDispatcher) {
        while dispatcher.processing_statistics().currently_active == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn failure_after_timeout_mark_still_schedules_retry() {
        let dispatcher = untimed(immediate_retries(3));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let evt = event("a", 1);
        let dispatch = dispatcher.dispatch(&evt, gated_failure(gate.clone()));
        let scan = async {
            until_active(&dispatcher).await;
            // 监控侧已标记超时，但在途记录尚未被扫描摘除时处理器失败
            assert_eq!(dispatcher.monitor.check_for_timeouts(Duration::ZERO).len(), 1);
            gate.add_permits(1);
        };
        let (outcome, ()) = tokio::join!(dispatch, scan);

        assert_eq!(outcome, DispatchOutcome::FailedScheduledRetry);
        assert!(dispatcher.retry_manager.is_pending(&RetryKey::new("a-1", "gated")));
        // 扫描的后半段不会再重复安排
        assert_eq!(dispatcher.check_for_timeouts(), 0);
        let retry = dispatcher.retry_statistics();
        assert_eq!(retry.scheduled, 1);
        assert_eq!(retry.active_retries, 1);
        let stats = dispatcher.processing_statistics();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn timeout_scan_owns_retry_when_it_claims_the_attempt() {
        let dispatcher = untimed(immediate_retries(1));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let evt = event("a", 1);
        let dispatch = dispatcher.dispatch(&evt, gated_failure(gate.clone()));
        let scan = async {
            until_active(&dispatcher).await;
            assert_eq!(dispatcher.check_for_timeouts(), 1);
            gate.add_permits(1);
        };
        let (outcome, ()) = tokio::join!(dispatch, scan);

        // 扫描已判定耗尽并转为死信，处理器的迟到失败只报告终态
        assert_eq!(outcome, DispatchOutcome::FailedTerminal);
        assert_eq!(dispatcher.dead_letters().len(), 1);
        assert_eq!(dispatcher.processing_statistics().permanently_failed, 1);
        assert_eq!(dispatcher.retry_statistics().exhausted, 1);
    }

    #[tokio::test]
    async fn rejection_leaves_tracker_and_monitor_untouched() {
        let dispatcher = ResilientDispatcher::builder()
            .backpressure(Arc::new(BackpressureManager::new(BackpressureConfig {
                max_concurrent_events: 1,
                ..Default::default()
            })))
            .build();
        let permit = dispatcher.backpressure.try_acquire().expect("slot");
        let log = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(
            dispatcher.dispatch(&event("a", 1), recorder("audit", log.clone())).await,
            DispatchOutcome::RejectedBackpressure
        );
        assert_eq!(dispatcher.current_sequence("a"), None);
        assert_eq!(dispatcher.processing_statistics().total_started, 0);

        drop(permit);
        assert_eq!(
            dispatcher.dispatch(&event("a", 1), recorder("audit", log.clone())).await,
            DispatchOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn dispatch_all_isolates_handler_failures() {
        let dispatcher = ResilientDispatcher::builder()
            .retry_manager(immediate_retries(3))
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = handler_fn("mailer", HandledEventType::All, |_| async {
            Err(anyhow::anyhow!("smtp down"))
        });

        let outcomes = dispatcher
            .dispatch_all(&event("a", 1), vec![recorder("inventory", log.clone()), failing])
            .await;
        assert_eq!(
            outcomes,
            vec![
                HandlerOutcome {
                    handler_name: "inventory".into(),
                    outcome: DispatchOutcome::Accepted
                },
                HandlerOutcome {
                    handler_name: "mailer".into(),
                    outcome: DispatchOutcome::FailedScheduledRetry
                },
            ]
        );
        assert_eq!(dispatcher.current_sequence("a"), Some(1));
        assert!(!dispatcher.retry_manager.is_pending(&RetryKey::new("a-1", "inventory")));
        assert!(dispatcher.retry_manager.is_pending(&RetryKey::new("a-1", "mailer")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_all_runs_on_spawned_tasks() {
        let dispatcher = Arc::new(ResilientDispatcher::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = vec![recorder("inventory", log.clone()), recorder("audit", log.clone())];

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let envelope = event("a", 1);
                dispatcher.dispatch_all(&envelope, handlers).await
            })
        };
        let outcomes = task.await.expect("dispatch task");

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.outcome == DispatchOutcome::Accepted));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn force_update_replays_ready_buffer() {
        let dispatcher = ResilientDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("audit", log.clone());

        dispatcher.dispatch(&event("a", 1), handler.clone()).await;
        dispatcher.dispatch(&event("a", 3), handler.clone()).await;
        dispatcher.dispatch(&event("a", 5), handler.clone()).await;

        let discarded = dispatcher.force_update_sequence("a", 4).await;
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].sequence(), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 5]);
        assert_eq!(dispatcher.current_sequence("a"), Some(5));
    }

    #[tokio::test]
    async fn health_reflects_failures() {
        let dispatcher = ResilientDispatcher::builder()
            .retry_manager(immediate_retries(5))
            .build();
        assert!(dispatcher.is_healthy());
        assert_eq!(dispatcher.system_health().score, 1.0);

        let failing = handler_fn("broken", HandledEventType::All, |_| async {
            Err(anyhow::anyhow!("always"))
        });
        for seq in 1..=5 {
            dispatcher.dispatch(&event("a", seq), failing.clone()).await;
        }

        let health = dispatcher.system_health();
        assert_eq!(health.processing_success_rate, 0.0);
        // 0.4 * 0 + 0.2 * (1 - 5/100) + 0.2 * 1 + 0.2 * 1
        assert!((health.score - 0.59).abs() < 1e-9, "{}", health.score);
        assert!(!health.healthy);
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "handler panicked");
    }
}
