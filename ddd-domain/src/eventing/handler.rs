//! 事件处理器（EventHandler）
//!
//! 定义消费某类/多类/全部事件的处理逻辑与元信息（名称、订阅类型）。
//! 投递层对处理器的业务逻辑无感知，只关心成功与失败。
//!
use crate::domain_event::EventEnvelope;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 事件处理器：处理某一类型的事件
///
/// 失败（返回错误、panic 或超时）会被重试，处理器需自行保证幂等。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于重试上下文、统计与日志）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理事件
    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

/// 以闭包实现的处理器，见 [`handler_fn`]
pub struct FnHandler<F> {
    name: String,
    handled: HandledEventType,
    f: F,
}

/// 将异步闭包包装为 `EventHandler`
///
/// ```rust
/// use ddd_domain::eventing::{EventHandler, HandledEventType, handler_fn};
///
/// let handler = handler_fn("audit", HandledEventType::All, |event| async move {
///     println!("{} #{}", event.aggregate_id(), event.sequence());
///     Ok(())
/// });
/// assert_eq!(handler.handler_name(), "audit");
/// ```
pub fn handler_fn<F, Fut>(
    name: impl Into<String>,
    handled: HandledEventType,
    f: F,
) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        handled,
        f,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn handled_event_type(&self) -> HandledEventType {
        self.handled.clone()
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}
