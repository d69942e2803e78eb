//! 事件投递演示
//!
//! 模拟若干订单聚合产生事件，经内存总线乱序、重复地发布，由事件引擎按序投递给
//! 库存投影与一个不稳定的通知处理器，最后输出健康度与各组件统计。

mod config;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use config::DemoConfig;
use ddd_domain::domain_event::{EventEnvelope, PendingEvents};
use ddd_domain::eventing::{
    BackpressureStatus, EventBus, EventEngine, EventHandler, HandledEventType, InMemoryEventBus,
    ProcessingStatistics, ResilientDispatcher, RetryStatistics, SequenceStatistics, SystemHealth,
    handler_fn,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    sku: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderCancelled {
    sku: String,
    quantity: u32,
}

/// 按订单维护的库存占用投影
#[derive(Default)]
struct InventoryProjection {
    reserved: Mutex<HashMap<String, i64>>,
    applied: AtomicUsize,
}

impl InventoryProjection {
    fn snapshot(&self) -> HashMap<String, i64> {
        self.reserved
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl EventHandler for InventoryProjection {
    fn handler_name(&self) -> &str {
        "inventory-projection"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::Many(vec!["OrderPlaced".into(), "OrderCancelled".into()])
    }

    async fn handle(&self, event: &EventEnvelope) -> AnyResult<()> {
        let (sku, delta) = match event.event_type() {
            "OrderPlaced" => {
                let e: OrderPlaced = serde_json::from_value(event.payload().clone())?;
                (e.sku, i64::from(e.quantity))
            }
            "OrderCancelled" => {
                let e: OrderCancelled = serde_json::from_value(event.payload().clone())?;
                (e.sku, -i64::from(e.quantity))
            }
            other => anyhow::bail!("unexpected event type {other}"),
        };

        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| anyhow::anyhow!("inventory projection poisoned"))?;
        *reserved.entry(sku).or_default() += delta;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Serialize)]
struct Report {
    health: SystemHealth,
    processing: ProcessingStatistics,
    retry: RetryStatistics,
    backpressure: BackpressureStatus,
    sequence: SequenceStatistics,
    dead_letters: usize,
    inventory: HashMap<String, i64>,
}

impl Report {
    fn collect(dispatcher: &ResilientDispatcher, inventory: &InventoryProjection) -> Self {
        Self {
            health: dispatcher.system_health(),
            processing: dispatcher.processing_statistics(),
            retry: dispatcher.retry_statistics(),
            backpressure: dispatcher.backpressure_status(),
            sequence: dispatcher.sequence_statistics(),
            dead_letters: dispatcher.dead_letters().len(),
            inventory: inventory.snapshot(),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// 为每个聚合生成事件序列：下单若干次，最后取消一次
fn order_events(aggregates: usize, per_aggregate: usize) -> AnyResult<Vec<EventEnvelope>> {
    let mut all = Vec::new();
    for n in 0..aggregates {
        let mut pending = PendingEvents::new(format!("order-{n}"), 0);
        let sku = format!("SKU-{}", n % 3);
        for i in 0..per_aggregate.saturating_sub(1) {
            pending.record(
                "OrderPlaced",
                &OrderPlaced {
                    sku: sku.clone(),
                    quantity: (i as u32 % 4) + 1,
                },
            )?;
        }
        pending.record("OrderCancelled", &json!({ "sku": sku, "quantity": 1 }))?;
        all.extend(pending);
    }
    Ok(all)
}

/// 打乱到达顺序并混入重复投递
fn scramble(events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::with_capacity(events.len() + events.len() / 3);
    for chunk in events.chunks(3) {
        out.extend(chunk.iter().rev().cloned());
        if let Some(first) = chunk.first() {
            out.push(first.clone());
        }
    }
    out
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = DemoConfig::from_env()?;
    init_tracing(config.log_json);
    info!(
        aggregates = config.aggregates,
        events_per_aggregate = config.events_per_aggregate,
        "starting eventing demo"
    );

    let dispatcher = Arc::new(config.eventing.build_dispatcher()?);
    let bus = Arc::new(InMemoryEventBus::new(config.bus_capacity));

    let inventory = Arc::new(InventoryProjection::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    // 每三次调用失败一次，依赖重试补偿
    let notification = handler_fn(
        "order-notification",
        HandledEventType::One("OrderPlaced".into()),
        move |event| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) % 3 == 0 {
                    return Err(anyhow::anyhow!(
                        "mail relay rejected {}#{}",
                        event.aggregate_id(),
                        event.sequence()
                    ));
                }
                Ok(())
            }
        },
    );

    let engine = Arc::new(
        EventEngine::builder()
            .event_bus(bus.clone())
            .dispatcher(dispatcher.clone())
            .event_handlers(vec![inventory.clone() as Arc<dyn EventHandler>, notification])
            .config(config.eventing.engine)
            .build(),
    );
    let handle = engine.start();

    while bus.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let events = order_events(config.aggregates, config.events_per_aggregate)?;
    let expected = events.len();
    bus.publish_batch(&scramble(events)).await?;
    info!(events = expected, "published order events");

    let settled = async {
        loop {
            let retry = dispatcher.retry_statistics();
            if inventory.applied.load(Ordering::SeqCst) >= expected && retry.active_retries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    tokio::select! {
        result = tokio::time::timeout(config.settle_timeout, settled) => {
            if result.is_err() {
                warn!(timeout = ?config.settle_timeout, "delivery did not settle in time");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    handle.shutdown();
    handle.join().await;

    dispatcher.log_statistics();
    let report = Report::collect(&dispatcher, &inventory);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
