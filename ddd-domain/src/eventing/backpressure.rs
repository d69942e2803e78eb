//! 背压管理（BackpressureManager）
//!
//! 观察在途投递数、排队深度与滑动窗口内的到达数，计算准入级别：
//! - `Normal` / `Elevated` / `High`：正常准入；
//! - `Critical`：拒绝准入，调用方应稍后重投，不计为失败、不消耗重试次数。
//!
//! 计数全部为原子操作，处理器执行期间不持有任何锁。
//!
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum BackpressureLevel {
    Normal = 0,
    Elevated = 1,
    High = 2,
    Critical = 3,
}

impl BackpressureLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackpressureLevel::Normal,
            1 => BackpressureLevel::Elevated,
            2 => BackpressureLevel::High,
            _ => BackpressureLevel::Critical,
        }
    }

    /// 健康度评分：Normal=1.0 … Critical=0.0
    pub fn health_score(&self) -> f64 {
        match self {
            BackpressureLevel::Normal => 1.0,
            BackpressureLevel::Elevated => 0.75,
            BackpressureLevel::High => 0.5,
            BackpressureLevel::Critical => 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackpressureConfig {
    /// 在途投递上限（达到即 Critical）
    pub max_concurrent_events: usize,
    /// 排队深度上限（超过即 Critical）
    pub max_queue_size: usize,
    /// 滑动窗口内允许的投递启动数；`None` 表示不按速率限流
    pub max_events_per_window: Option<u64>,
    pub rate_window: Duration,
    /// 利用率达到该比例进入 Elevated
    pub elevated_threshold: f64,
    /// 利用率达到该比例进入 High
    pub high_threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrent_events: 100,
            max_queue_size: 1_000,
            max_events_per_window: None,
            rate_window: Duration::from_secs(1),
            elevated_threshold: 0.7,
            high_threshold: 0.9,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackpressureStatus {
    pub level: BackpressureLevel,
    pub current_concurrent_events: usize,
    pub current_queue_size: usize,
    pub events_in_current_window: u64,
    pub utilization: f64,
    pub last_level_change_at: DateTime<Utc>,
}

/// 两桶滑动窗口：上一窗口计数按剩余比例折算后与当前窗口相加
struct RateWindow {
    width_ms: u64,
    current_start_ms: AtomicU64,
    current: AtomicU64,
    previous: AtomicU64,
}

impl RateWindow {
    fn new(width: Duration) -> Self {
        Self {
            width_ms: (width.as_millis() as u64).max(1),
            current_start_ms: AtomicU64::new(0),
            current: AtomicU64::new(0),
            previous: AtomicU64::new(0),
        }
    }

    fn rotate(&self, now_ms: u64) {
        loop {
            let start = self.current_start_ms.load(Ordering::Acquire);
            let elapsed = now_ms.saturating_sub(start);
            if elapsed < self.width_ms {
                return;
            }
            let new_start = now_ms - elapsed % self.width_ms;
            if self
                .current_start_ms
                .compare_exchange(start, new_start, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let carried = self.current.swap(0, Ordering::AcqRel);
                let previous = if elapsed < self.width_ms * 2 { carried } else { 0 };
                self.previous.store(previous, Ordering::Release);
                return;
            }
        }
    }

    fn record(&self, now_ms: u64) {
        self.rotate(now_ms);
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    fn estimate(&self, now_ms: u64) -> u64 {
        let start = self.current_start_ms.load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(start);
        let current = self.current.load(Ordering::Acquire);
        let previous = self.previous.load(Ordering::Acquire);
        let width = self.width_ms as f64;

        if elapsed >= self.width_ms * 2 {
            0
        } else if elapsed >= self.width_ms {
            let weight = 1.0 - (elapsed - self.width_ms) as f64 / width;
            (current as f64 * weight).round() as u64
        } else {
            let weight = 1.0 - elapsed as f64 / width;
            (previous as f64 * weight).round() as u64 + current
        }
    }
}

/// 在途名额；释放时自动归还
#[must_use = "dropping the permit releases the in-flight slot immediately"]
pub struct InFlightPermit<'a> {
    manager: &'a BackpressureManager,
}

impl Drop for InFlightPermit<'_> {
    fn drop(&mut self) {
        self.manager.concurrent.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BackpressureManager {
    config: BackpressureConfig,
    concurrent: AtomicUsize,
    queued: AtomicUsize,
    window: RateWindow,
    level: AtomicU8,
    last_level_change_ms: AtomicI64,
    epoch: Instant,
}

impl Default for BackpressureManager {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

impl BackpressureManager {
    pub fn new(config: BackpressureConfig) -> Self {
        let window = RateWindow::new(config.rate_window);
        Self {
            config,
            concurrent: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            window,
            level: AtomicU8::new(BackpressureLevel::Normal as u8),
            last_level_change_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// 由三项指标与阈值推导的利用率（无隐藏状态）
    pub fn utilization(&self, concurrent: usize, events_in_window: u64) -> f64 {
        let concurrency = concurrent as f64 / self.config.max_concurrent_events.max(1) as f64;
        let rate = match self.config.max_events_per_window {
            Some(limit) => events_in_window as f64 / limit.max(1) as f64,
            None => 0.0,
        };
        concurrency.max(rate)
    }

    /// 由三项指标与阈值推导的级别（无隐藏状态）
    pub fn level_for(&self, concurrent: usize, queued: usize, events_in_window: u64) -> BackpressureLevel {
        if queued > self.config.max_queue_size {
            return BackpressureLevel::Critical;
        }
        let utilization = self.utilization(concurrent, events_in_window);
        if utilization >= 1.0 {
            BackpressureLevel::Critical
        } else if utilization >= self.config.high_threshold {
            BackpressureLevel::High
        } else if utilization >= self.config.elevated_threshold {
            BackpressureLevel::Elevated
        } else {
            BackpressureLevel::Normal
        }
    }

    fn snapshot(&self) -> (usize, usize, u64) {
        (
            self.concurrent.load(Ordering::Acquire),
            self.queued.load(Ordering::Acquire),
            self.window.estimate(self.now_ms()),
        )
    }

    fn observe(&self, level: BackpressureLevel) {
        let previous = BackpressureLevel::from_u8(self.level.swap(level as u8, Ordering::AcqRel));
        if previous == level {
            return;
        }
        self.last_level_change_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);

        let (concurrent, queued, in_window) = self.snapshot();
        if level == BackpressureLevel::Critical {
            warn!(?previous, ?level, concurrent, queued, in_window, "backpressure level changed");
        } else {
            info!(?previous, ?level, concurrent, queued, in_window, "backpressure level changed");
        }
    }

    fn current_level(&self) -> BackpressureLevel {
        let (concurrent, queued, in_window) = self.snapshot();
        let level = self.level_for(concurrent, queued, in_window);
        self.observe(level);
        level
    }

    /// 是否允许新的投递（只读检查，不占用名额）
    pub fn admit(&self) -> bool {
        self.current_level() != BackpressureLevel::Critical
    }

    /// 准入并占用一个在途名额；Critical 或名额已满时返回 `None`
    pub fn try_acquire(&self) -> Option<InFlightPermit<'_>> {
        if self.current_level() == BackpressureLevel::Critical {
            return None;
        }

        let max = self.config.max_concurrent_events;
        if self
            .concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c < max).then_some(c + 1))
            .is_err()
        {
            self.observe(BackpressureLevel::Critical);
            return None;
        }

        self.window.record(self.now_ms());
        Some(InFlightPermit { manager: self })
    }

    /// 登记已接收但尚未开始的工作
    pub fn enqueue(&self, count: usize) {
        self.queued.fetch_add(count, Ordering::AcqRel);
    }

    pub fn dequeue(&self, count: usize) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(count)));
    }

    pub fn status(&self) -> BackpressureStatus {
        let (concurrent, queued, in_window) = self.snapshot();
        let level = self.level_for(concurrent, queued, in_window);
        self.observe(level);

        BackpressureStatus {
            level,
            current_concurrent_events: concurrent,
            current_queue_size: queued,
            events_in_current_window: in_window,
            utilization: self.utilization(concurrent, in_window),
            last_level_change_at: DateTime::from_timestamp_millis(
                self.last_level_change_ms.load(Ordering::Acquire),
            )
            .unwrap_or_default(),
        }
    }
}
