use std::ops::Deref;
use std::slice::Iter;
use std::vec::IntoIter;

use serde::Serialize;

use crate::error::{DomainError, DomainResult};

use super::event_envelope::EventEnvelope;

/// 一次业务操作内产生的待发布事件
///
/// 由调用方显式持有并在提交成功后交给投递层，
/// 序号从聚合当前序号之后连续分配。
#[derive(Debug, Clone)]
pub struct PendingEvents {
    aggregate_id: String,
    last_sequence: u64,
    events: Vec<EventEnvelope>,
}

impl PendingEvents {
    /// `current_sequence` 为聚合已发布的最后序号（新聚合为 0）
    pub fn new(aggregate_id: impl Into<String>, current_sequence: u64) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            last_sequence: current_sequence,
            events: Vec::new(),
        }
    }

    /// 记录一个事件，返回分配好序号的信封
    pub fn record<T>(
        &mut self,
        event_type: impl Into<String>,
        payload: &T,
    ) -> DomainResult<&EventEnvelope>
    where
        T: Serialize + ?Sized,
    {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(DomainError::InvalidValue {
                reason: "event_type must not be empty".to_string(),
            });
        }

        let sequence = self
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| DomainError::InvalidValue {
                reason: format!("sequence overflow for aggregate {}", self.aggregate_id),
            })?;

        let envelope = EventEnvelope::builder()
            .aggregate_id(self.aggregate_id.clone())
            .sequence(sequence)
            .event_type(event_type)
            .payload(serde_json::to_value(payload)?)
            .build();

        self.last_sequence = sequence;
        self.events.push(envelope);

        Ok(&self.events[self.events.len() - 1])
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// 已分配的最后序号
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, EventEnvelope> {
        self.events.iter()
    }
}

impl IntoIterator for PendingEvents {
    type Item = EventEnvelope;
    type IntoIter = IntoIter<EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a PendingEvents {
    type Item = &'a EventEnvelope;
    type IntoIter = Iter<'a, EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl Deref for PendingEvents {
    type Target = [EventEnvelope];

    fn deref(&self) -> &Self::Target {
        &self.events
    }
}
