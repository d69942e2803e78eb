//! 演示程序配置，从环境变量（或 `.env` 文件）加载
//!
//! 未设置或无法解析的变量回退到组件默认值，组装后的 `EventingConfig` 仍需通过校验。

use ddd_domain::error::DomainResult;
use ddd_domain::eventing::{EventingConfig, OutOfOrderPolicy};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// 输出 JSON 格式日志
    pub log_json: bool,
    pub bus_capacity: usize,
    /// 模拟的订单聚合数量
    pub aggregates: usize,
    /// 每个聚合产生的事件数
    pub events_per_aggregate: usize,
    /// 等待投递完成的最长时间
    pub settle_timeout: Duration,
    pub eventing: EventingConfig,
}

impl DemoConfig {
    pub fn from_env() -> DomainResult<Self> {
        dotenvy::dotenv().ok();

        let mut eventing = EventingConfig::default();

        if let Ok(policy) = std::env::var("EVENTING_OUT_OF_ORDER_POLICY") {
            eventing.sequence.out_of_order_policy = policy.parse::<OutOfOrderPolicy>()?;
        }
        eventing.sequence.seen_window_size =
            parse_env("EVENTING_SEEN_WINDOW_SIZE", eventing.sequence.seen_window_size);

        let bp = &mut eventing.backpressure;
        bp.max_concurrent_events = parse_env("EVENTING_MAX_CONCURRENT_EVENTS", bp.max_concurrent_events);
        bp.max_queue_size = parse_env("EVENTING_MAX_QUEUE_SIZE", bp.max_queue_size);
        bp.max_events_per_window = std::env::var("EVENTING_MAX_EVENTS_PER_SECOND")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(bp.max_events_per_window);

        let retry = &mut eventing.retry;
        retry.max_attempts = parse_env("EVENTING_RETRY_MAX_ATTEMPTS", retry.max_attempts);
        retry.initial_delay = parse_millis("EVENTING_RETRY_INITIAL_DELAY_MS", retry.initial_delay);
        retry.max_delay = parse_millis("EVENTING_RETRY_MAX_DELAY_MS", retry.max_delay);
        retry.multiplier = parse_env("EVENTING_RETRY_MULTIPLIER", retry.multiplier);
        retry.jitter_factor = parse_env("EVENTING_RETRY_JITTER", retry.jitter_factor);

        let dispatcher = &mut eventing.dispatcher;
        dispatcher.processing_timeout =
            parse_millis("EVENTING_PROCESSING_TIMEOUT_MS", dispatcher.processing_timeout);
        dispatcher.handler_timeout = dispatcher
            .handler_timeout
            .map(|t| parse_millis("EVENTING_HANDLER_TIMEOUT_MS", t));

        let engine = &mut eventing.engine;
        engine.retry_poll_interval = parse_millis("EVENTING_RETRY_POLL_MS", engine.retry_poll_interval);
        engine.timeout_scan_interval =
            parse_millis("EVENTING_TIMEOUT_SCAN_MS", engine.timeout_scan_interval);
        engine.statistics_log_interval =
            parse_millis("EVENTING_STATISTICS_LOG_MS", engine.statistics_log_interval);
        engine.delivery_capacity =
            parse_env("EVENTING_DELIVERY_CAPACITY", engine.delivery_capacity);

        eventing.validate()?;

        Ok(Self {
            log_json: std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
            bus_capacity: parse_env("EVENT_BUS_CAPACITY", 1024),
            aggregates: parse_env("DEMO_AGGREGATES", 4),
            events_per_aggregate: parse_env("DEMO_EVENTS_PER_AGGREGATE", 5),
            settle_timeout: parse_millis("DEMO_SETTLE_TIMEOUT_MS", Duration::from_secs(10)),
            eventing,
        })
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
