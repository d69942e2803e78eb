//! DDD 领域事件投递库（ddd-domain）
//!
//! 为业务操作产出的领域事件提供进程内的可靠投递：
//! - 领域事件（`domain_event`）：不可变的事件信封与按聚合分配序号的待发布累加器；
//! - 事件系统（`eventing`）：序号校验与去重、背压准入、失败重试与死信、
//!   处理监控与健康度，以及订阅总线并运行维护任务的事件引擎；
//! - 统一错误（`error`）。
//!
//! 本 crate 不持久化事件，也不绑定具体传输实现，通过 `EventBus` 协议对接既有的发布机制。
//!
//! 典型用法：
//! 1. 业务操作内用 `PendingEvents` 记录事件，提交成功后取出信封；
//! 2. 通过 `EventBus` 发布，或直接调用 `ResilientDispatcher::dispatch`；
//! 3. 使用 `EventEngine` 订阅总线、分发到处理器并周期驱动重试与清理；
//! 4. 通过投递器的统计与 `system_health` 对接外部观测。
//!
pub mod domain_event;
pub mod error;
#[cfg(feature = "eventing")]
pub mod eventing;
