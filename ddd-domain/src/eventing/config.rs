//! 事件子系统配置汇总
//!
//! 各组件配置均提供合理默认值；`validate` 在组装前拒绝无法工作的取值。
//!
use super::backpressure::{BackpressureConfig, BackpressureManager};
use super::dispatcher::{DispatcherConfig, ResilientDispatcher};
use super::engine::EventEngineConfig;
use super::monitor::{MonitorConfig, ProcessingMonitor};
use super::retry::{RetryConfig, RetryManager};
use super::sequence::{SequenceTracker, SequenceTrackerConfig};
use crate::error::{DomainError, DomainResult};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct EventingConfig {
    pub sequence: SequenceTrackerConfig,
    pub backpressure: BackpressureConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub dispatcher: DispatcherConfig,
    pub engine: EventEngineConfig,
}

fn positive(field: &'static str, value: usize) -> DomainResult<()> {
    if value == 0 {
        return Err(DomainError::invalid_config(field, "must be greater than 0"));
    }
    Ok(())
}

fn non_zero(field: &'static str, value: Duration) -> DomainResult<()> {
    if value.is_zero() {
        return Err(DomainError::invalid_config(field, "must be a non-zero duration"));
    }
    Ok(())
}

fn fraction(field: &'static str, value: f64) -> DomainResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(DomainError::invalid_config(
            field,
            format!("must be within [0, 1], got {value}"),
        ));
    }
    Ok(())
}

impl EventingConfig {
    pub fn validate(&self) -> DomainResult<()> {
        positive("sequence.seen_window_size", self.sequence.seen_window_size)?;

        let bp = &self.backpressure;
        positive("backpressure.max_concurrent_events", bp.max_concurrent_events)?;
        non_zero("backpressure.rate_window", bp.rate_window)?;
        if bp.max_events_per_window == Some(0) {
            return Err(DomainError::invalid_config(
                "backpressure.max_events_per_window",
                "must be greater than 0 when set",
            ));
        }
        fraction("backpressure.elevated_threshold", bp.elevated_threshold)?;
        fraction("backpressure.high_threshold", bp.high_threshold)?;
        if bp.elevated_threshold > bp.high_threshold {
            return Err(DomainError::invalid_config(
                "backpressure.elevated_threshold",
                "must not exceed high_threshold",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(DomainError::invalid_config(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(DomainError::invalid_config(
                "retry.multiplier",
                format!("must be a finite value >= 1, got {}", retry.multiplier),
            ));
        }
        fraction("retry.jitter_factor", retry.jitter_factor)?;
        if retry.initial_delay > retry.max_delay {
            return Err(DomainError::invalid_config(
                "retry.initial_delay",
                "must not exceed max_delay",
            ));
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.handler_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DomainError::invalid_config(
                "dispatcher.handler_timeout",
                "must be a non-zero duration when set",
            ));
        }
        non_zero("dispatcher.processing_timeout", dispatcher.processing_timeout)?;
        positive("dispatcher.handler_concurrency", dispatcher.handler_concurrency)?;
        positive("dispatcher.retry_concurrency", dispatcher.retry_concurrency)?;

        let health = &dispatcher.health;
        for (field, weight) in [
            ("dispatcher.health.processing_weight", health.processing_weight),
            ("dispatcher.health.retry_weight", health.retry_weight),
            ("dispatcher.health.backpressure_weight", health.backpressure_weight),
            ("dispatcher.health.sequence_weight", health.sequence_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(DomainError::invalid_config(field, "must be a non-negative number"));
            }
        }
        if health.processing_weight
            + health.retry_weight
            + health.backpressure_weight
            + health.sequence_weight
            <= 0.0
        {
            return Err(DomainError::invalid_config(
                "dispatcher.health",
                "at least one weight must be positive",
            ));
        }
        fraction("dispatcher.health.healthy_threshold", health.healthy_threshold)?;

        let engine = &self.engine;
        non_zero("engine.retry_poll_interval", engine.retry_poll_interval)?;
        non_zero("engine.timeout_scan_interval", engine.timeout_scan_interval)?;
        non_zero("engine.retry_cleanup_interval", engine.retry_cleanup_interval)?;
        non_zero("engine.sequence_cleanup_interval", engine.sequence_cleanup_interval)?;
        non_zero("engine.statistics_log_interval", engine.statistics_log_interval)?;
        positive("engine.delivery_capacity", engine.delivery_capacity)?;

        Ok(())
    }

    /// 校验后组装投递器及其组件
    pub fn build_dispatcher(&self) -> DomainResult<ResilientDispatcher> {
        self.validate()?;

        Ok(ResilientDispatcher::builder()
            .sequence_tracker(Arc::new(SequenceTracker::new(self.sequence.clone())))
            .backpressure(Arc::new(BackpressureManager::new(self.backpressure.clone())))
            .retry_manager(Arc::new(RetryManager::new(self.retry.clone())))
            .monitor(Arc::new(ProcessingMonitor::new(self.monitor.clone())))
            .config(self.dispatcher.clone())
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EventingConfig::default();
        assert!(config.validate().is_ok());
        let dispatcher = config.build_dispatcher().expect("dispatcher");
        assert_eq!(dispatcher.config().handler_concurrency, 8);
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = EventingConfig::default();
        config.retry.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidConfig {
                field: "retry.max_attempts",
                ..
            }
        ));
        assert!(config.build_dispatcher().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = EventingConfig::default();
        config.backpressure.elevated_threshold = 0.95;
        config.backpressure.high_threshold = 0.9;
        assert!(config.validate().is_err());

        config.backpressure.elevated_threshold = 0.5;
        config.backpressure.high_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_intervals_and_weights() {
        let mut config = EventingConfig::default();
        config.engine.retry_poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = EventingConfig::default();
        config.engine.delivery_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EventingConfig::default();
        config.dispatcher.health.processing_weight = 0.0;
        config.dispatcher.health.retry_weight = 0.0;
        config.dispatcher.health.backpressure_weight = 0.0;
        config.dispatcher.health.sequence_weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = EventingConfig::default();
        config.dispatcher.handler_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
        config.dispatcher.handler_timeout = None;
        assert!(config.validate().is_ok());
    }
}
