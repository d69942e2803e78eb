//! 聚合序号跟踪（SequenceTracker）
//!
//! 在事件到达处理器之前校验聚合内顺序并去重：
//! - 序号恰为 `last_valid + 1` 时有效并推进；
//! - 不大于 `last_valid`、出现在近期窗口或已在缓冲区中的序号视为重复；
//! - 超前的序号按 `OutOfOrderPolicy` 缓冲等待补齐，或带告警直接放行。
//!
//! 每个聚合一把互斥锁，不同聚合之间互不竞争。
//!
use crate::domain_event::EventEnvelope;
use crate::error::DomainError;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use super::ratio;

/// 乱序事件的处理策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// 缓冲到缺口补齐后按序重放（缓冲区满时退化为放行）
    #[default]
    Buffer,
    /// 立即放行并记录缺口
    AcceptWithWarning,
}

impl FromStr for OutOfOrderPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffer" => Ok(OutOfOrderPolicy::Buffer),
            "accept" | "accept_with_warning" => Ok(OutOfOrderPolicy::AcceptWithWarning),
            other => Err(DomainError::InvalidValue {
                reason: format!("unknown out-of-order policy: {other}"),
            }),
        }
    }
}

/// 乱序事件最终的去向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfOrderDisposition {
    Buffered,
    Accepted,
}

/// 序号校验结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceCheck {
    Valid,
    Duplicate,
    OutOfOrder {
        expected: u64,
        disposition: OutOfOrderDisposition,
    },
}

#[derive(Clone, Debug)]
pub struct SequenceTrackerConfig {
    pub out_of_order_policy: OutOfOrderPolicy,
    /// 每个聚合保留的近期序号数量（用于乱序到达的旧事件去重）
    pub seen_window_size: usize,
    /// 每个聚合最多缓冲的乱序事件数
    pub max_buffered_per_aggregate: usize,
    /// 聚合无活动超过该时长后清理
    pub record_retention: Duration,
}

impl Default for SequenceTrackerConfig {
    fn default() -> Self {
        Self {
            out_of_order_policy: OutOfOrderPolicy::Buffer,
            seen_window_size: 1024,
            max_buffered_per_aggregate: 1024,
            record_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SequenceStatistics {
    pub tracked_aggregates: usize,
    pub tracked_sequences: usize,
    pub buffered_events: usize,
    pub valid_events: u64,
    pub duplicate_events: u64,
    pub out_of_order_events: u64,
    pub valid_rate: f64,
    pub duplicate_rate: f64,
    pub out_of_order_rate: f64,
}

/// 过期清理结果；`flushed` 为被清理聚合中仍在缓冲的事件，需由调用方继续投递
#[derive(Debug, Default)]
pub struct SequenceCleanup {
    pub removed_records: usize,
    pub flushed: Vec<EventEnvelope>,
}

struct SequenceRecord {
    last_valid_sequence: u64,
    seen_window: BTreeSet<u64>,
    buffered: BTreeMap<u64, EventEnvelope>,
    last_updated_at: DateTime<Utc>,
    // 已从表中摘除；持有旧引用的调用方需重新获取
    retired: bool,
}

impl SequenceRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_valid_sequence: 0,
            seen_window: BTreeSet::new(),
            buffered: BTreeMap::new(),
            last_updated_at: now,
            retired: false,
        }
    }

    fn is_known(&self, sequence: u64) -> bool {
        sequence <= self.last_valid_sequence
            || self.seen_window.contains(&sequence)
            || self.buffered.contains_key(&sequence)
    }

    // 只淘汰已被 last_valid 覆盖的序号；缺口之上已放行的序号必须保留
    fn remember(&mut self, sequence: u64, window: usize) {
        self.seen_window.insert(sequence);
        while self.seen_window.len() > window {
            match self.seen_window.first() {
                Some(&oldest) if oldest <= self.last_valid_sequence => {
                    self.seen_window.pop_first();
                }
                _ => break,
            }
        }
    }

    // 已越过缺口放行、尚未被 last_valid 吸收的序号数
    fn open_gaps(&self) -> usize {
        self.seen_window
            .range(self.last_valid_sequence.saturating_add(1)..)
            .count()
    }

    // 接受 last_valid + 1，并吸收其后已放行的连续序号
    fn advance(&mut self, sequence: u64, window: usize) {
        self.last_valid_sequence = sequence;
        self.fold_contiguous();
        self.remember(sequence, window);
    }

    // 吸收此前已放行的连续乱序序号
    fn fold_contiguous(&mut self) {
        while self
            .seen_window
            .contains(&self.last_valid_sequence.saturating_add(1))
        {
            self.last_valid_sequence += 1;
        }
    }
}

/// 聚合序号跟踪器
pub struct SequenceTracker {
    config: SequenceTrackerConfig,
    records: DashMap<String, Arc<Mutex<SequenceRecord>>>,
    valid: AtomicU64,
    duplicate: AtomicU64,
    out_of_order: AtomicU64,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(SequenceTrackerConfig::default())
    }
}

impl SequenceTracker {
    pub fn new(config: SequenceTrackerConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            valid: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SequenceTrackerConfig {
        &self.config
    }

    fn with_record<R>(&self, aggregate_id: &str, f: impl FnOnce(&mut SequenceRecord) -> R) -> R {
        loop {
            let record = self
                .records
                .entry(aggregate_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SequenceRecord::new(Utc::now()))))
                .value()
                .clone();

            let mut guard = record.lock().unwrap_or_else(PoisonError::into_inner);
            if !guard.retired {
                return f(&mut guard);
            }
        }
    }

    fn existing(&self, aggregate_id: &str) -> Option<Arc<Mutex<SequenceRecord>>> {
        self.records.get(aggregate_id).map(|r| r.value().clone())
    }

    /// 校验事件序号；`Buffer` 策略下乱序事件会被存入缓冲区
    ///
    /// 序号从 1 开始，0 总是被判为重复。
    pub fn validate(&self, envelope: &EventEnvelope) -> SequenceCheck {
        self.validate_with(envelope, |_| {})
    }

    /// 同 [`validate`](Self::validate)，事件被缓冲时在聚合锁内调用 `on_buffered`，
    /// 保证回调先于该事件被 [`take_ready`](Self::take_ready) 取出
    pub fn validate_with(
        &self,
        envelope: &EventEnvelope,
        on_buffered: impl FnOnce(&EventEnvelope),
    ) -> SequenceCheck {
        let sequence = envelope.sequence();
        let window = self.config.seen_window_size;
        let buffer_cap = self.config.max_buffered_per_aggregate;
        let policy = self.config.out_of_order_policy;

        let check = self.with_record(envelope.aggregate_id(), |record| {
            record.last_updated_at = Utc::now();

            if record.is_known(sequence) {
                return SequenceCheck::Duplicate;
            }

            let expected = record.last_valid_sequence.saturating_add(1);
            if sequence == expected {
                record.advance(sequence, window);
                return SequenceCheck::Valid;
            }

            let buffer_has_room = record.buffered.len() < buffer_cap;
            let window_has_room = record.open_gaps() < window;
            let disposition = if policy == OutOfOrderPolicy::Buffer && buffer_has_room {
                OutOfOrderDisposition::Buffered
            } else if window_has_room {
                OutOfOrderDisposition::Accepted
            } else {
                // 窗口已被缺口序号占满，再放行将无法去重，只能超额缓冲
                warn!(
                    aggregate_id = %envelope.aggregate_id(),
                    sequence,
                    expected,
                    open_gaps = window,
                    "sequence window saturated, buffering out-of-order event"
                );
                OutOfOrderDisposition::Buffered
            };

            match disposition {
                OutOfOrderDisposition::Buffered => {
                    on_buffered(envelope);
                    record.buffered.insert(sequence, envelope.clone());
                }
                OutOfOrderDisposition::Accepted => record.remember(sequence, window),
            }

            SequenceCheck::OutOfOrder {
                expected,
                disposition,
            }
        });

        let counter = match check {
            SequenceCheck::Valid => &self.valid,
            SequenceCheck::Duplicate => &self.duplicate,
            SequenceCheck::OutOfOrder { .. } => &self.out_of_order,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        check
    }

    /// 取出缺口已补齐的下一个缓冲事件（序号为 `last_valid + 1`）
    ///
    /// 取出与判定有效在同一把聚合锁内完成，返回的事件已计为有效，无需再次校验。
    pub fn take_ready(&self, aggregate_id: &str) -> Option<EventEnvelope> {
        let window = self.config.seen_window_size;
        let record = self.existing(aggregate_id)?;
        let mut guard = record.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.retired {
            return None;
        }
        let next = guard.last_valid_sequence.saturating_add(1);
        let envelope = guard.buffered.remove(&next)?;
        guard.advance(next, window);
        guard.last_updated_at = Utc::now();
        drop(guard);

        self.valid.fetch_add(1, Ordering::Relaxed);
        Some(envelope)
    }

    pub fn current_sequence(&self, aggregate_id: &str) -> Option<u64> {
        let record = self.existing(aggregate_id)?;
        let guard = record.lock().unwrap_or_else(PoisonError::into_inner);
        (!guard.retired).then_some(guard.last_valid_sequence)
    }

    /// 重置聚合序号，返回被丢弃的缓冲事件
    pub fn reset_sequence(&self, aggregate_id: &str) -> Vec<EventEnvelope> {
        let Some((_, record)) = self.records.remove(aggregate_id) else {
            return Vec::new();
        };
        let mut guard = record.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retired = true;
        let discarded: Vec<EventEnvelope> = std::mem::take(&mut guard.buffered).into_values().collect();

        info!(
            aggregate_id = %aggregate_id,
            last_sequence = guard.last_valid_sequence,
            discarded = discarded.len(),
            "aggregate sequence reset"
        );
        discarded
    }

    /// 运维覆盖：强制设置聚合的有效序号，返回因此失效的缓冲事件
    pub fn force_update_sequence(&self, aggregate_id: &str, sequence: u64) -> Vec<EventEnvelope> {
        let window = self.config.seen_window_size;
        let (previous, discarded) = self.with_record(aggregate_id, |record| {
            let previous = record.last_valid_sequence;
            record.last_updated_at = Utc::now();
            record.seen_window.retain(|&s| s > sequence);
            record.advance(sequence, window);

            let kept = record.buffered.split_off(&sequence.saturating_add(1));
            let discarded = std::mem::replace(&mut record.buffered, kept);
            (previous, discarded.into_values().collect::<Vec<_>>())
        });

        warn!(
            aggregate_id = %aggregate_id,
            previous,
            sequence,
            discarded = discarded.len(),
            "aggregate sequence force-updated"
        );
        discarded
    }

    /// 清理超过保留期未活动的聚合记录
    pub fn cleanup_expired_records(&self) -> SequenceCleanup {
        let mut cleanup = SequenceCleanup::default();
        let Ok(retention) = TimeDelta::from_std(self.config.record_retention) else {
            return cleanup;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return cleanup;
        };

        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| {
                let guard = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
                guard.last_updated_at <= cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();

        for aggregate_id in candidates {
            let mut flushed = Vec::new();
            let removed = self.records.remove_if(&aggregate_id, |_, record| {
                let mut guard = record.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.last_updated_at > cutoff {
                    return false;
                }
                guard.retired = true;
                flushed = std::mem::take(&mut guard.buffered).into_values().collect();
                true
            });

            if removed.is_some() {
                cleanup.removed_records += 1;
                if !flushed.is_empty() {
                    warn!(
                        aggregate_id = %aggregate_id,
                        flushed = flushed.len(),
                        "expired aggregate still had buffered events, flushing them"
                    );
                    cleanup.flushed.append(&mut flushed);
                }
            }
        }

        cleanup
    }

    pub fn statistics(&self) -> SequenceStatistics {
        let valid_events = self.valid.load(Ordering::Relaxed);
        let duplicate_events = self.duplicate.load(Ordering::Relaxed);
        let out_of_order_events = self.out_of_order.load(Ordering::Relaxed);
        let total = valid_events + duplicate_events + out_of_order_events;

        let mut stats = SequenceStatistics {
            valid_events,
            duplicate_events,
            out_of_order_events,
            valid_rate: ratio(valid_events, total),
            duplicate_rate: ratio(duplicate_events, total),
            out_of_order_rate: ratio(out_of_order_events, total),
            ..Default::default()
        };

        for entry in self.records.iter() {
            let guard = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
            stats.tracked_aggregates += 1;
            stats.tracked_sequences += guard.seen_window.len();
            stats.buffered_events += guard.buffered.len();
        }

        stats
    }
}
