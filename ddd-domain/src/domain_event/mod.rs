//! 领域事件（Domain Event）
//!
//! 定义投递层使用的不可变事件信封 `EventEnvelope`，以及在一次业务操作内
//! 显式收集待发布事件的 `PendingEvents`。

mod event_envelope;
mod pending_events;

pub use event_envelope::EventEnvelope;
pub use pending_events::PendingEvents;
