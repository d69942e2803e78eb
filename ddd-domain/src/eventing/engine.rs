//! 事件引擎（EventEngine）
//!
//! 统一编排“订阅 → 可靠投递 → 周期维护”的长驻任务：
//! - 订阅总线事件流，按处理器匹配后交给 `ResilientDispatcher`；同一聚合串行，不同聚合并发；
//! - 被背压拒绝的事件进入本地重投队列，按 `rejection_backoff` 节奏重投，不阻塞事件流；
//! - 周期执行重试轮询、超时扫描、重试上下文清理、序号记录清理与统计日志；
//! - 提供关闭与等待的 `EngineHandle`。
//!
use super::dispatcher::{DispatchOutcome, HandlerOutcome, ResilientDispatcher};
use super::handler::HandledEventType;
use super::{EventBus, EventHandler};
use crate::domain_event::EventEnvelope;
use bon::Builder;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::{sync::Arc, time::Duration};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::event_engine_builder::{IsUnset, SetRegistry, State as BuilderState};

/// EventEngine：
/// - 订阅 Bus 的事件流，经 Dispatcher 分发到匹配的 Handler
/// - 周期性驱动 Dispatcher 的重试与维护任务
#[derive(Builder)]
pub struct EventEngine {
    event_bus: Arc<dyn EventBus>,
    #[builder(default)]
    dispatcher: Arc<ResilientDispatcher>,
    #[builder(setters(vis = "pub(crate)"))]
    registry: HandlerRegistry,
    #[builder(default)]
    config: EventEngineConfig,
}

impl<S: BuilderState> EventEngineBuilder<S> {
    pub fn event_handlers(
        self,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> EventEngineBuilder<SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
    {
        self.registry(HandlerRegistry::new(handlers))
    }
}

impl EventEngine {
    pub fn dispatcher(&self) -> &Arc<ResilientDispatcher> {
        &self.dispatcher
    }

    /// 启动事件引擎，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(6);
        let config = self.config;

        // retry poll
        {
            let dispatcher = self.dispatcher.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.retry_poll_interval,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        let retried = dispatcher.process_due_retries().await;
                        if retried > 0 {
                            debug!(retried, "due retries dispatched");
                        }
                    }
                },
            ));
        }

        // timeout scan
        {
            let dispatcher = self.dispatcher.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.timeout_scan_interval,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        dispatcher.check_for_timeouts();
                    }
                },
            ));
        }

        // retry context cleanup
        {
            let dispatcher = self.dispatcher.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.retry_cleanup_interval,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        let expired = dispatcher.cleanup_retry_contexts();
                        if expired > 0 {
                            info!(expired, "expired retry contexts removed");
                        }
                    }
                },
            ));
        }

        // sequence record cleanup
        {
            let dispatcher = self.dispatcher.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.sequence_cleanup_interval,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        let removed = dispatcher.cleanup_sequence_records().await;
                        if removed > 0 {
                            info!(removed, "idle aggregate sequence records removed");
                        }
                    }
                },
            ));
        }

        // statistics log
        {
            let dispatcher = self.dispatcher.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.statistics_log_interval,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.log_statistics() }
                },
            ));
        }

        // subscribe worker（长循环）
        tasks.push(tokio::spawn(Self::subscribe_loop(
            self.clone(),
            token.clone(),
        )));

        info!(handlers = self.registry.len(), "event engine started");
        EngineHandle { token, tasks }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    /// 将事件分发给所有匹配的处理器（单次尝试，不做背压退避）
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Vec<HandlerOutcome> {
        let handlers = self.registry.matching(envelope.event_type());
        self.dispatcher.dispatch_all(envelope, handlers).await
    }

    // 单次投递；被背压拒绝时交回事件，由订阅循环稍后重投
    async fn deliver_once(&self, envelope: EventEnvelope) -> Option<EventEnvelope> {
        let handlers = self.registry.matching(envelope.event_type());
        if handlers.is_empty() {
            return None;
        }

        let outcomes = self.dispatcher.dispatch_all(&envelope, handlers).await;
        if outcomes
            .iter()
            .any(|o| o.outcome == DispatchOutcome::RejectedBackpressure)
        {
            return Some(envelope);
        }

        let failed = outcomes.iter().filter(|o| o.outcome.is_failure()).count();
        if failed > 0 {
            debug!(
                event_id = %envelope.event_id(),
                aggregate_id = %envelope.aggregate_id(),
                failed,
                "event delivered with handler failures"
            );
        }
        None
    }

    async fn subscribe_loop(self: Arc<Self>, token: CancellationToken) {
        let mut stream = self.event_bus.subscribe().await;
        let capacity = self.config.delivery_capacity.max(1);
        let mut deliveries = Deliveries::default();
        let mut redelivery = time::interval(self.config.rejection_backoff.max(MIN_INTERVAL));
        redelivery.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stream_open = true;

        loop {
            if !stream_open && deliveries.is_idle() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    break;
                }
                Some(joined) = deliveries.tasks.join_next_with_id(), if !deliveries.tasks.is_empty() => {
                    deliveries.finish(&self, joined);
                }
                _ = redelivery.tick(), if !deliveries.deferred.is_empty() => {
                    while let Some(envelope) = deliveries.deferred.pop_front() {
                        deliveries.spawn(&self, envelope);
                    }
                }
                maybe_event = stream.next(), if stream_open && deliveries.held() < capacity => {
                    match maybe_event {
                        Some(Ok(event)) => deliveries.admit(&self, event),
                        Some(Err(err)) => {
                            warn!(error = %err, "event bus stream error, continuing");
                        }
                        None => {
                            info!("event bus stream closed");
                            stream_open = false;
                        }
                    }
                }
            }
        }

        // 等待进行中的投递收尾；仍未准入或排队中的事件记录后放弃
        while let Some(joined) = deliveries.tasks.join_next().await {
            if let Ok(Some(envelope)) = joined {
                deliveries.deferred.push_back(envelope);
            }
        }
        let abandoned = deliveries.deferred.len() + deliveries.queued;
        if abandoned > 0 {
            warn!(abandoned, "engine stopped before all events were delivered");
        }
    }
}

/// 订阅循环内的投递状态：同一聚合按到达顺序串行投递，不同聚合并发
#[derive(Default)]
struct Deliveries {
    tasks: JoinSet<Option<EventEnvelope>>,
    owners: HashMap<task::Id, String>,
    // 有事件在投递中或等待重投的聚合；队列为其后排队的事件
    lanes: HashMap<String, VecDeque<EventEnvelope>>,
    // 被背压拒绝、等待重投的事件（其聚合通道保持占用）
    deferred: VecDeque<EventEnvelope>,
    queued: usize,
}

impl Deliveries {
    fn admit(&mut self, engine: &Arc<EventEngine>, envelope: EventEnvelope) {
        match self.lanes.get_mut(envelope.aggregate_id()) {
            Some(queue) => {
                queue.push_back(envelope);
                self.queued += 1;
            }
            None => {
                self.lanes
                    .insert(envelope.aggregate_id().to_string(), VecDeque::new());
                self.spawn(engine, envelope);
            }
        }
    }

    fn spawn(&mut self, engine: &Arc<EventEngine>, envelope: EventEnvelope) {
        let aggregate_id = envelope.aggregate_id().to_string();
        let engine = engine.clone();
        let handle = self
            .tasks
            .spawn(async move { engine.deliver_once(envelope).await });
        self.owners.insert(handle.id(), aggregate_id);
    }

    fn finish(
        &mut self,
        engine: &Arc<EventEngine>,
        joined: Result<(task::Id, Option<EventEnvelope>), task::JoinError>,
    ) {
        let (id, rejected) = match joined {
            Ok((id, rejected)) => (id, rejected),
            Err(err) => {
                warn!(error = %err, "event delivery task failed");
                (err.id(), None)
            }
        };
        let Some(aggregate_id) = self.owners.remove(&id) else {
            return;
        };

        if let Some(envelope) = rejected {
            self.deferred.push_back(envelope);
            return;
        }

        let next = match self.lanes.get_mut(&aggregate_id) {
            Some(queue) => queue.pop_front(),
            None => None,
        };
        match next {
            Some(envelope) => {
                self.queued -= 1;
                self.spawn(engine, envelope);
            }
            None => {
                self.lanes.remove(&aggregate_id);
            }
        }
    }

    // 引擎当前持有的事件数（投递中、待重投与排队）
    fn held(&self) -> usize {
        self.lanes.len() + self.queued
    }

    fn is_idle(&self) -> bool {
        self.lanes.is_empty()
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Default)]
struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    all: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let mut by_type: HashMap<String, Vec<Arc<dyn EventHandler>>> = HashMap::new();
        let mut all: Vec<Arc<dyn EventHandler>> = Vec::new();

        for h in handlers {
            match h.handled_event_type() {
                HandledEventType::All => all.push(h),
                HandledEventType::One(t) => {
                    by_type.entry(t).or_default().push(h);
                }
                HandledEventType::Many(ts) => {
                    for t in ts {
                        by_type.entry(t).or_default().push(h.clone());
                    }
                }
            }
        }

        Self { by_type, all }
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<Arc<dyn EventHandler>> = Vec::new();
        if let Some(list) = self.by_type.get(event_type) {
            merged.extend(list.iter().cloned());
        }
        merged.extend(self.all.iter().cloned());
        merged
    }

    fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum::<usize>() + self.all.len()
    }
}

/// 事件引擎配置
#[derive(Clone, Copy, Debug)]
pub struct EventEngineConfig {
    /// 重试轮询间隔
    pub retry_poll_interval: Duration,
    /// 处理超时扫描间隔
    pub timeout_scan_interval: Duration,
    /// 重试上下文清理间隔
    pub retry_cleanup_interval: Duration,
    /// 聚合序号记录清理间隔
    pub sequence_cleanup_interval: Duration,
    /// 统计日志间隔
    pub statistics_log_interval: Duration,
    /// 背压拒绝后的重投等待
    pub rejection_backoff: Duration,
    /// 订阅循环同时持有的事件上限（投递中、待重投与排队）；达到上限时暂停读取总线
    pub delivery_capacity: usize,
}

impl Default for EventEngineConfig {
    fn default() -> Self {
        Self {
            retry_poll_interval: Duration::from_secs(1),
            timeout_scan_interval: Duration::from_secs(60),
            retry_cleanup_interval: Duration::from_secs(300),
            sequence_cleanup_interval: Duration::from_secs(3600),
            statistics_log_interval: Duration::from_secs(600),
            rejection_backoff: Duration::from_millis(100),
            delivery_capacity: 256,
        }
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventing::backpressure::{BackpressureConfig, BackpressureManager};
    use crate::eventing::retry::{RetryConfig, RetryManager};
    use crate::eventing::{InMemoryEventBus, handler_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(sequence: u64, ty: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_id(format!("order-1-{sequence}"))
            .aggregate_id("order-1")
            .sequence(sequence)
            .event_type(ty)
            .build()
    }

    fn counting(name: &str, handled: HandledEventType, fail_first: usize) -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn(name.to_string(), handled, move |_| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < fail_first {
                    return Err(anyhow::anyhow!("transient failure"));
                }
                Ok(())
            }
        });
        (handler, calls)
    }

    fn fast_config() -> EventEngineConfig {
        EventEngineConfig {
            retry_poll_interval: Duration::from_millis(20),
            rejection_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_for_subscriber(bus: &InMemoryEventBus) {
        let _ = time::timeout(Duration::from_secs(2), async {
            while bus.subscriber_count() == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[test]
    fn registry_routes_by_event_type() {
        let (paid, _) = counting("paid", HandledEventType::One("OrderPaid".into()), 0);
        let (many, _) = counting(
            "many",
            HandledEventType::Many(vec!["OrderPaid".into(), "OrderShipped".into()]),
            0,
        );
        let (all, _) = counting("all", HandledEventType::All, 0);
        let registry = HandlerRegistry::new(vec![paid, many, all]);

        let names = |ty: &str| -> Vec<String> {
            registry
                .matching(ty)
                .iter()
                .map(|h| h.handler_name().to_string())
                .collect()
        };
        assert_eq!(names("OrderPaid"), vec!["paid", "many", "all"]);
        assert_eq!(names("OrderShipped"), vec!["many", "all"]);
        assert_eq!(names("Other"), vec!["all"]);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_delivers_and_retries_failed_handlers() {
        let bus = Arc::new(InMemoryEventBus::new(64));
        let dispatcher = Arc::new(
            ResilientDispatcher::builder()
                .retry_manager(Arc::new(RetryManager::new(RetryConfig {
                    initial_delay: Duration::from_millis(10),
                    jitter_factor: 0.0,
                    ..Default::default()
                })))
                .build(),
        );
        let (audit, audit_calls) = counting("audit", HandledEventType::All, 0);
        let (billing, billing_calls) =
            counting("billing", HandledEventType::One("OrderPaid".into()), 1);

        let engine = Arc::new(
            EventEngine::builder()
                .event_bus(bus.clone())
                .dispatcher(dispatcher.clone())
                .event_handlers(vec![audit, billing])
                .config(fast_config())
                .build(),
        );
        let handle = engine.clone().start();
        wait_for_subscriber(&bus).await;

        bus.publish_batch(&[event(1, "OrderPlaced"), event(2, "OrderPaid")])
            .await
            .expect("publish");

        let _ = time::timeout(Duration::from_secs(2), async {
            while billing_calls.load(Ordering::SeqCst) < 2 || audit_calls.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(audit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(billing_calls.load(Ordering::SeqCst), 2);
        let stats = dispatcher.processing_statistics();
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(dispatcher.retry_statistics().recovered, 1);
        assert_eq!(dispatcher.current_sequence("order-1"), Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_events_are_redelivered_after_backoff() {
        let bus = Arc::new(InMemoryEventBus::new(64));
        let backpressure = Arc::new(BackpressureManager::new(BackpressureConfig {
            max_concurrent_events: 1,
            ..Default::default()
        }));
        let dispatcher = Arc::new(
            ResilientDispatcher::builder()
                .backpressure(backpressure.clone())
                .build(),
        );
        let (audit, calls) = counting("audit", HandledEventType::All, 0);
        let engine = Arc::new(
            EventEngine::builder()
                .event_bus(bus.clone())
                .dispatcher(dispatcher.clone())
                .event_handlers(vec![audit])
                .config(fast_config())
                .build(),
        );
        let handle = engine.start();
        wait_for_subscriber(&bus).await;

        let permit = backpressure.try_acquire().expect("slot");
        bus.publish(&event(1, "OrderPlaced")).await.expect("publish");
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(permit);
        let _ = time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.processing_statistics().failed, 0);
    }

    fn job(aggregate_id: &str, sequence: u64, ty: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_id(format!("{aggregate_id}-{sequence}"))
            .aggregate_id(aggregate_id)
            .sequence(sequence)
            .event_type(ty)
            .build()
    }

    fn gated(name: &str, handled: HandledEventType, gate: Arc<tokio::sync::Semaphore>) -> Arc<dyn EventHandler> {
        handler_fn(name.to_string(), handled, move |_| {
            let gate = gate.clone();
            async move {
                let _ = gate.acquire().await;
                Ok(())
            }
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let _ = time::timeout(Duration::from_secs(3), async {
            while !condition() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_handler_does_not_stall_other_aggregates() {
        let bus = Arc::new(InMemoryEventBus::new(4));
        let dispatcher = Arc::new(ResilientDispatcher::default());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let slow = gated("slow", HandledEventType::One("SlowJob".into()), gate.clone());
        let (fast, fast_calls) = counting("fast", HandledEventType::One("FastJob".into()), 0);

        let engine = Arc::new(
            EventEngine::builder()
                .event_bus(bus.clone())
                .dispatcher(dispatcher.clone())
                .event_handlers(vec![slow, fast])
                .config(fast_config())
                .build(),
        );
        let handle = engine.start();
        wait_for_subscriber(&bus).await;

        bus.publish(&job("slow", 1, "SlowJob")).await.expect("publish");
        wait_for(|| dispatcher.processing_statistics().currently_active == 1).await;

        for sequence in 1..=6 {
            bus.publish(&job("fast", sequence, "FastJob")).await.expect("publish");
            time::sleep(Duration::from_millis(5)).await;
        }
        wait_for(|| fast_calls.load(Ordering::SeqCst) == 6).await;
        assert_eq!(fast_calls.load(Ordering::SeqCst), 6);
        assert_eq!(dispatcher.processing_statistics().currently_active, 1);

        gate.add_permits(1);
        wait_for(|| dispatcher.processing_statistics().currently_active == 0).await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(dispatcher.processing_statistics().succeeded, 7);
        assert_eq!(dispatcher.current_sequence("fast"), Some(6));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_events_queue_without_blocking_the_stream() {
        let bus = Arc::new(InMemoryEventBus::new(2));
        let dispatcher = Arc::new(
            ResilientDispatcher::builder()
                .backpressure(Arc::new(BackpressureManager::new(BackpressureConfig {
                    max_concurrent_events: 1,
                    ..Default::default()
                })))
                .build(),
        );
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let slow = gated("slow", HandledEventType::One("SlowJob".into()), gate.clone());
        let (fast, fast_calls) = counting("fast", HandledEventType::One("FastJob".into()), 0);

        let engine = Arc::new(
            EventEngine::builder()
                .event_bus(bus.clone())
                .dispatcher(dispatcher.clone())
                .event_handlers(vec![slow, fast])
                .config(fast_config())
                .build(),
        );
        let handle = engine.start();
        wait_for_subscriber(&bus).await;

        // 慢处理器占住唯一的在途名额
        bus.publish(&job("slow", 1, "SlowJob")).await.expect("publish");
        wait_for(|| dispatcher.backpressure_status().current_concurrent_events == 1).await;

        for sequence in 1..=6 {
            bus.publish(&job("fast", sequence, "FastJob")).await.expect("publish");
            time::sleep(Duration::from_millis(5)).await;
        }
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fast_calls.load(Ordering::SeqCst), 0);

        gate.add_permits(1);
        wait_for(|| fast_calls.load(Ordering::SeqCst) == 6).await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(fast_calls.load(Ordering::SeqCst), 6);
        assert_eq!(dispatcher.current_sequence("fast"), Some(6));
        let stats = dispatcher.processing_statistics();
        assert_eq!(stats.succeeded, 7);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn direct_dispatch_routes_to_matching_handlers() {
        let (paid, paid_calls) = counting("paid", HandledEventType::One("OrderPaid".into()), 0);
        let engine = EventEngine::builder()
            .event_bus(Arc::new(InMemoryEventBus::default()))
            .event_handlers(vec![paid])
            .build();

        assert!(engine.dispatch(&event(1, "OrderPlaced")).await.is_empty());
        let outcomes = engine.dispatch(&event(1, "OrderPaid")).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome, DispatchOutcome::Accepted);
        assert_eq!(paid_calls.load(Ordering::SeqCst), 1);
    }
}
