/// Eventing 引擎（内存版）示例
/// 展示 PendingEvents -> Bus -> Engine -> Handlers 的闭环：乱序到达的事件被缓冲后按序投递，
/// 失败的处理器由重试补偿，耗尽后进入死信
use anyhow::Result as AnyResult;
use ddd_domain::domain_event::PendingEvents;
use ddd_domain::eventing::{
    EventBus, EventEngine, EventEngineConfig, EventingConfig, HandledEventType, InMemoryEventBus,
    handler_fn,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() -> AnyResult<()> {
    let mut config = EventingConfig::default();
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.max_attempts = 3;
    config.engine = EventEngineConfig {
        retry_poll_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let dispatcher = Arc::new(config.build_dispatcher()?);
    let bus = Arc::new(InMemoryEventBus::new(64));

    let printer = handler_fn("printer", HandledEventType::All, |event| async move {
        println!(
            "[printer] {}#{} {} {}",
            event.aggregate_id(),
            event.sequence(),
            event.event_type(),
            event.payload()
        );
        Ok(())
    });

    // 首次失败，第二次成功
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = handler_fn(
        "flaky-mailer",
        HandledEventType::One("AccountOpened".into()),
        move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(anyhow::anyhow!("mailer offline"));
                }
                Ok(())
            }
        },
    );

    // 总是失败，最终进入死信
    let broken = handler_fn(
        "broken-audit",
        HandledEventType::One("MoneyDeposited".into()),
        |_| async { Err(anyhow::anyhow!("audit store unreachable")) },
    );

    let engine = Arc::new(
        EventEngine::builder()
            .event_bus(bus.clone())
            .dispatcher(dispatcher.clone())
            .event_handlers(vec![printer, flaky, broken])
            .config(config.engine)
            .build(),
    );
    let handle = engine.start();
    while bus.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut pending = PendingEvents::new("acc-1", 0);
    pending.record("AccountOpened", &json!({"owner": "alice"}))?;
    pending.record("MoneyDeposited", &json!({"amount": 100}))?;
    pending.record("MoneyWithdrawn", &json!({"amount": 30}))?;
    let events: Vec<_> = pending.into_iter().collect();

    // 先发 #3 再发 #1、#2，并重复一次 #1
    bus.publish(&events[2]).await?;
    bus.publish(&events[0]).await?;
    bus.publish(&events[1]).await?;
    bus.publish(&events[0]).await?;

    tokio::time::sleep(Duration::from_millis(800)).await;
    handle.shutdown();
    handle.join().await;

    println!("processing: {:?}", dispatcher.processing_statistics());
    println!("retry: {:?}", dispatcher.retry_statistics());
    println!("sequence: {:?}", dispatcher.sequence_statistics());
    for letter in dispatcher.dead_letters() {
        println!(
            "dead letter: {} handler={} attempts={} error={}",
            letter.envelope.event_id(),
            letter.handler_name,
            letter.attempts,
            letter.last_error
        );
    }
    println!("health: {:?}", dispatcher.system_health());
    Ok(())
}
