use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 事件信封：业务层产出后不可变，按聚合内序号投递
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// 事件唯一标识（默认 UUID v4）
    #[builder(into, default = Uuid::new_v4().to_string())]
    event_id: String,
    /// 所属聚合（事件流）
    #[builder(into)]
    aggregate_id: String,
    /// 聚合内单调递增序号，从 1 开始，由生产方分配
    sequence: u64,
    /// 事件类型
    #[builder(into)]
    event_type: String,
    /// 事件发生时间
    #[builder(default = Utc::now())]
    occurred_at: DateTime<Utc>,
    /// 处理器自行解释的载荷
    #[builder(default)]
    payload: Value,
}

impl EventEnvelope {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
