//! 重试管理（RetryManager）
//!
//! 以 (事件, 处理器) 为键维护重试上下文：
//! - 失败时按指数退避 + 抖动安排下一次重试；
//! - 达到最大次数后移除上下文并记为死信；
//! - 超过保留期仍未完成的上下文同样转为死信（原因 `Expired`）。
//!
use crate::domain_event::EventEnvelope;
use crate::eventing::EventHandler;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// 总尝试次数上限（含首次投递）
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例，0.1 表示 ±10%
    pub jitter_factor: f64,
    /// 上下文最长保留时间
    pub context_retention: Duration,
    /// 内存中保留的死信条数
    pub dead_letter_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
            context_retention: Duration::from_secs(3600),
            dead_letter_capacity: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub event_id: String,
    pub handler_name: String,
}

impl RetryKey {
    pub fn new(event_id: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            handler_name: handler_name.into(),
        }
    }
}

impl fmt::Display for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.event_id, self.handler_name)
    }
}

/// 等待重试的投递
#[derive(Clone)]
pub struct RetryContext {
    envelope: EventEnvelope,
    handler: Arc<dyn EventHandler>,
    attempt_count: u32,
    max_attempts: u32,
    next_retry_at: DateTime<Utc>,
    last_error: String,
    created_at: DateTime<Utc>,
    claimed: bool,
}

impl fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryContext")
            .field("event_id", &self.envelope.event_id())
            .field("handler", &self.handler.handler_name())
            .field("attempt_count", &self.attempt_count)
            .field("max_attempts", &self.max_attempts)
            .field("next_retry_at", &self.next_retry_at)
            .field("last_error", &self.last_error)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl RetryContext {
    pub fn key(&self) -> RetryKey {
        RetryKey::new(self.envelope.event_id(), self.handler.handler_name())
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// 已失败的尝试次数
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug)]
pub enum RetryDecision {
    /// 已安排下一次重试
    Scheduled(RetryContext),
    /// 次数耗尽，已转为死信
    Exhausted(RetryContext),
}

impl RetryDecision {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryDecision::Exhausted(_))
    }

    pub fn context(&self) -> &RetryContext {
        match self {
            RetryDecision::Scheduled(ctx) | RetryDecision::Exhausted(ctx) => ctx,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    Exhausted,
    Expired,
}

/// 终态失败记录，不再自动重试
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub handler_name: String,
    pub attempts: u32,
    pub last_error: String,
    pub reason: DeadLetterReason,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryStatistics {
    pub active_retries: usize,
    pub total_retry_attempts: u64,
    pub scheduled: u64,
    pub exhausted: u64,
    pub expired: u64,
    pub recovered: u64,
    pub dead_letters: usize,
}

pub struct RetryManager {
    config: RetryConfig,
    contexts: DashMap<RetryKey, RetryContext>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    total_retry_attempts: AtomicU64,
    scheduled: AtomicU64,
    exhausted: AtomicU64,
    expired: AtomicU64,
    recovered: AtomicU64,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            total_retry_attempts: AtomicU64::new(0),
            scheduled: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 第 `attempt` 次失败后的等待时长
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let jitter = if self.config.jitter_factor > 0.0 {
            1.0 + self.config.jitter_factor * (2.0 * rand::random::<f64>() - 1.0)
        } else {
            1.0
        };
        let max = self.config.max_delay.as_secs_f64();
        let secs = (base * jitter).clamp(0.0, max);
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_delay
        }
    }

    /// 记录一次失败并决定后续：继续重试或转为死信
    pub fn schedule_retry(
        &self,
        envelope: &EventEnvelope,
        handler: &Arc<dyn EventHandler>,
        error: &str,
    ) -> RetryDecision {
        let key = RetryKey::new(envelope.event_id(), handler.handler_name());
        let now = Utc::now();

        let mut entry = self.contexts.entry(key.clone()).or_insert_with(|| RetryContext {
            envelope: envelope.clone(),
            handler: handler.clone(),
            attempt_count: 0,
            max_attempts: self.config.max_attempts,
            next_retry_at: now,
            last_error: String::new(),
            created_at: now,
            claimed: false,
        });

        entry.attempt_count = entry.attempt_count.saturating_add(1);
        entry.last_error = error.to_string();

        if entry.attempt_count >= entry.max_attempts {
            let ctx = entry.clone();
            drop(entry);
            self.contexts.remove(&key);
            self.exhausted.fetch_add(1, Ordering::Relaxed);

            error!(
                event_id = %ctx.envelope.event_id(),
                handler = %ctx.handler.handler_name(),
                attempts = ctx.attempt_count,
                error = %ctx.last_error,
                "retries exhausted, event dead-lettered"
            );
            self.push_dead_letter(&ctx, DeadLetterReason::Exhausted, now);
            return RetryDecision::Exhausted(ctx);
        }

        let delay = self.backoff_delay(entry.attempt_count);
        entry.next_retry_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        entry.claimed = false;
        let ctx = entry.clone();
        drop(entry);
        self.scheduled.fetch_add(1, Ordering::Relaxed);

        warn!(
            event_id = %ctx.envelope.event_id(),
            handler = %ctx.handler.handler_name(),
            attempt = ctx.attempt_count,
            max_attempts = ctx.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %ctx.last_error,
            "dispatch failed, retry scheduled"
        );
        RetryDecision::Scheduled(ctx)
    }

    /// 取出已到期且未被领取的上下文，并标记为已领取
    pub fn due_for_retry(&self, now: DateTime<Utc>) -> Vec<RetryContext> {
        let mut due: Vec<RetryContext> = self
            .contexts
            .iter_mut()
            .filter_map(|mut entry| {
                let ctx = entry.value_mut();
                if ctx.claimed || ctx.next_retry_at > now {
                    return None;
                }
                ctx.claimed = true;
                Some(ctx.clone())
            })
            .collect();
        due.sort_by_key(|ctx| ctx.next_retry_at);
        due
    }

    /// 退回领取（例如被背压拒绝），不消耗尝试次数
    pub fn release(&self, key: &RetryKey) {
        if let Some(mut ctx) = self.contexts.get_mut(key) {
            ctx.claimed = false;
        }
    }

    pub fn record_retry_attempt(&self, key: &RetryKey) {
        self.total_retry_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "retry attempt issued");
    }

    /// 成功后移除上下文；存在上下文即视为一次恢复
    pub fn clear(&self, key: &RetryKey) -> Option<RetryContext> {
        let (_, ctx) = self.contexts.remove(key)?;
        self.recovered.fetch_add(1, Ordering::Relaxed);
        info!(
            event_id = %ctx.envelope.event_id(),
            handler = %ctx.handler.handler_name(),
            failed_attempts = ctx.attempt_count,
            "dispatch recovered after retry"
        );
        Some(ctx)
    }

    pub fn is_pending(&self, key: &RetryKey) -> bool {
        self.contexts.contains_key(key)
    }

    /// 清理超过保留期的上下文（正在重试中的除外），返回清理数量
    pub fn cleanup_expired_contexts(&self) -> usize {
        let now = Utc::now();
        let retention = TimeDelta::from_std(self.config.context_retention).unwrap_or(TimeDelta::MAX);
        let is_expired =
            |ctx: &RetryContext| !ctx.claimed && now.signed_duration_since(ctx.created_at) >= retention;

        let keys: Vec<RetryKey> = self
            .contexts
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some((_, ctx)) = self.contexts.remove_if(&key, |_, ctx| is_expired(ctx)) {
                removed += 1;
                self.expired.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %ctx.envelope.event_id(),
                    handler = %ctx.handler.handler_name(),
                    attempts = ctx.attempt_count,
                    "retry context expired, event dead-lettered"
                );
                self.push_dead_letter(&ctx, DeadLetterReason::Expired, now);
            }
        }
        removed
    }

    fn push_dead_letter(&self, ctx: &RetryContext, reason: DeadLetterReason, at: DateTime<Utc>) {
        let capacity = self.config.dead_letter_capacity;
        if capacity == 0 {
            return;
        }
        let mut letters = self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner);
        while letters.len() >= capacity {
            letters.pop_front();
        }
        letters.push_back(DeadLetter {
            envelope: ctx.envelope.clone(),
            handler_name: ctx.handler.handler_name().to_string(),
            attempts: ctx.attempt_count,
            last_error: ctx.last_error.clone(),
            reason,
            failed_at: at,
        });
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> RetryStatistics {
        RetryStatistics {
            active_retries: self.contexts.len(),
            total_retry_attempts: self.total_retry_attempts.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            dead_letters: self
                .dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}
