//! 领域层统一错误定义
//!
//! 聚焦序列化、配置校验、事件总线与事件处理器等最小必要集合，
//! 便于在各实现层统一转换为 `DomainError`。
//!
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },

    // --- 配置 ---
    #[error("invalid config: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    // --- 事件系统 ---
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },
    #[error("event handler timed out: handler={handler}, timeout_ms={timeout_ms}")]
    HandlerTimeout { handler: String, timeout_ms: u128 },
    #[error("event handler panicked: handler={handler}, reason={reason}")]
    HandlerPanicked { handler: String, reason: String },
}

impl DomainError {
    pub fn event_bus(reason: impl Into<String>) -> Self {
        DomainError::EventBus {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        DomainError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;
