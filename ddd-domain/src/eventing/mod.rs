//! 事件子系统（eventing）
//!
//! 在既有发布机制之上提供进程内的可靠投递协调层：
//! - `SequenceTracker`：按聚合校验序号，去重并处理乱序；
//! - `BackpressureManager`：按在途数、排队深度与到达速率计算准入级别；
//! - `RetryManager`：失败重试（指数退避 + 抖动）与死信；
//! - `ProcessingMonitor`：记录每次投递尝试的生命周期与统计；
//! - `ResilientDispatcher`：编排以上组件的投递入口，并汇总健康度；
//! - `EventEngine`：订阅 `EventBus`，分发到处理器并运行周期性维护任务。
//!
//! 不持久化事件、不保证对外部系统的恰好一次投递，处理器需自行幂等。
//!
pub mod backpressure;
pub mod bus;
pub mod bus_inmemory;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod handler;
pub mod monitor;
pub mod retry;
pub mod sequence;

pub use backpressure::{
    BackpressureConfig, BackpressureLevel, BackpressureManager, BackpressureStatus, InFlightPermit,
};
pub use bus::EventBus;
pub use bus_inmemory::InMemoryEventBus;
pub use config::EventingConfig;
pub use dispatcher::{
    DispatchOutcome, DispatcherConfig, HandlerOutcome, HealthConfig, ResilientDispatcher,
    SystemHealth,
};
pub use engine::{EngineHandle, EventEngine, EventEngineConfig};
pub use handler::{EventHandler, FnHandler, HandledEventType, handler_fn};
pub use monitor::{
    AttemptId, MonitorConfig, ProcessingMonitor, ProcessingRecord, ProcessingState,
    ProcessingStatistics,
};
pub use retry::{
    DeadLetter, DeadLetterReason, RetryConfig, RetryContext, RetryDecision, RetryKey,
    RetryManager, RetryStatistics,
};
pub use sequence::{
    OutOfOrderDisposition, OutOfOrderPolicy, SequenceCheck, SequenceCleanup, SequenceStatistics,
    SequenceTracker, SequenceTrackerConfig,
};

/// `count / total`，`total` 为 0 时返回 0
pub(crate) fn ratio(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}
