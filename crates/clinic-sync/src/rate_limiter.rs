//! 客户端限流模块
//!
//! 按 `(identity, class)` 计数的固定窗口限流器，拦截敏感或高频操作。
//! 仅为建议性限流：权威限流在服务端，本模块只负责减少无效请求。
//!
//! ## 默认限流类别
//!
//! | 类别 | 限制 | 窗口 |
//! |------|------|------|
//! | `auth` | 5 次 | 15 分钟 |
//! | `sensitive` | 10 次 | 1 分钟 |
//! | `write` | 30 次 | 1 分钟 |
//! | `read` | 100 次 | 1 分钟 |
//!
//! 未配置的类别按最严格的已配置类别处理（fail closed），且共用同一个计数桶。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ClinicSyncError, Result};

/// 单个类别的限流规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// 窗口内允许的最大请求数
    pub max_requests: u32,
    /// 窗口长度（毫秒）
    pub window_ms: u64,
}

impl LimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// 单位时间允许量越小越严格
    fn strictness(&self) -> f64 {
        self.max_requests as f64 / self.window_ms.max(1) as f64
    }
}

/// 未知类别共用的桶名
const UNKNOWN_CLASS_BUCKET: &str = "__unknown__";

/// 计数桶数量超过该值时，在 `consume` 中顺带清理过期桶
pub const DEFAULT_PURGE_THRESHOLD: usize = 10_000;

fn default_purge_threshold() -> usize {
    DEFAULT_PURGE_THRESHOLD
}

/// 限流器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub classes: HashMap<String, LimitRule>,
    #[serde(default = "default_purge_threshold")]
    pub purge_threshold: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert("auth".to_string(), LimitRule::new(5, Duration::from_secs(15 * 60)));
        classes.insert("sensitive".to_string(), LimitRule::new(10, Duration::from_secs(60)));
        classes.insert("write".to_string(), LimitRule::new(30, Duration::from_secs(60)));
        classes.insert("read".to_string(), LimitRule::new(100, Duration::from_secs(60)));
        Self {
            classes,
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
        }
    }
}

impl RateLimiterConfig {
    pub fn with_class(mut self, class: impl Into<String>, rule: LimitRule) -> Self {
        self.classes.insert(class.into(), rule);
        self
    }

    /// 最严格的规则；未配置任何类别时为每分钟 1 次
    pub fn most_restrictive(&self) -> LimitRule {
        self.classes
            .values()
            .copied()
            .min_by(|a, b| a.strictness().total_cmp(&b.strictness()))
            .unwrap_or(LimitRule {
                max_requests: 1,
                window_ms: 60_000,
            })
    }

    /// 查找类别规则，未知类别退化为最严格规则
    pub fn rule_for(&self, class: &str) -> LimitRule {
        match self.classes.get(class) {
            Some(rule) => *rule,
            None => {
                warn!("未知限流类别 {}，使用最严格规则", class);
                self.most_restrictive()
            }
        }
    }

    /// 计数桶使用的类别名：未知类别全部归入同一个桶
    fn bucket_class<'a>(&self, class: &'a str) -> &'a str {
        if self.classes.contains_key(class) {
            class
        } else {
            UNKNOWN_CLASS_BUCKET
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (class, rule) in &self.classes {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(ClinicSyncError::Config(format!(
                    "限流类别 {} 的 max_requests 与 window_ms 必须大于 0",
                    class
                )));
            }
        }
        Ok(())
    }
}

/// 限流判定结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub success: bool,
    /// 窗口内剩余次数
    pub remaining: u32,
    /// 距离窗口重置的等待时间（成功时为 0）
    pub wait_time_ms: u64,
    pub message: Option<String>,
}

/// `(identity, class)` 对应的计数桶
#[derive(Debug, Clone)]
struct RateLimitBucket {
    count: u32,
    window_start: Instant,
    rule: LimitRule,
}

impl RateLimitBucket {
    fn new(rule: LimitRule, now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            rule,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.rule.window()
    }

    fn remaining_window(&self, now: Instant) -> Duration {
        self.rule
            .window()
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// 限流统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub blocked: u64,
    pub active_buckets: usize,
}

#[derive(Debug, Default)]
struct LimiterState {
    buckets: HashMap<(String, String), RateLimitBucket>,
    allowed: u64,
    blocked: u64,
}

/// 固定窗口限流器（线程安全，同一 identity 的并发调用串行更新计数）
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// 消耗一次配额
    pub fn consume(&self, identity: &str, class: &str) -> RateLimitDecision {
        self.consume_at(identity, class, Instant::now())
    }

    fn consume_at(&self, identity: &str, class: &str, now: Instant) -> RateLimitDecision {
        let rule = self.config.rule_for(class);
        let bucket_class = self.config.bucket_class(class);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.buckets.len() >= self.config.purge_threshold {
            let before = state.buckets.len();
            state.buckets.retain(|_, bucket| !bucket.is_expired(now));
            debug!("清理过期限流桶: {} 个", before - state.buckets.len());
        }

        let bucket = state
            .buckets
            .entry((identity.to_string(), bucket_class.to_string()))
            .or_insert_with(|| RateLimitBucket::new(rule, now));

        if bucket.is_expired(now) {
            bucket.count = 0;
            bucket.window_start = now;
            bucket.rule = rule;
        }

        if bucket.count >= bucket.rule.max_requests {
            // 至少等待 1ms，避免调用方得到 0 误以为可以立即重试
            let wait_time_ms = (bucket.remaining_window(now).as_millis() as u64).max(1);
            state.blocked += 1;
            debug!(
                "限流: identity={}, class={}, 需等待 {}ms",
                identity, class, wait_time_ms
            );
            return RateLimitDecision {
                success: false,
                remaining: 0,
                wait_time_ms,
                message: Some(format!(
                    "操作过于频繁，请在 {} 秒后重试",
                    wait_time_ms.div_ceil(1000)
                )),
            };
        }

        bucket.count += 1;
        let remaining = bucket.rule.max_requests - bucket.count;
        state.allowed += 1;

        RateLimitDecision {
            success: true,
            remaining,
            wait_time_ms: 0,
            message: None,
        }
    }

    /// 与 `consume` 相同，但失败时返回 `RateLimitExceeded`
    pub fn check(&self, identity: &str, class: &str) -> Result<RateLimitDecision> {
        let decision = self.consume(identity, class);
        if decision.success {
            Ok(decision)
        } else {
            Err(ClinicSyncError::RateLimitExceeded {
                class: class.to_string(),
                wait_time_ms: decision.wait_time_ms,
                message: decision.message.unwrap_or_default(),
            })
        }
    }

    /// 重置某个 identity 在某类别下的计数
    pub fn reset(&self, identity: &str, class: &str) {
        let bucket_class = self.config.bucket_class(class);
        self.state
            .lock()
            .buckets
            .remove(&(identity.to_string(), bucket_class.to_string()));
    }

    /// 清理窗口已过期的桶，返回清理数量
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| !bucket.is_expired(now));
        before - state.buckets.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            allowed: state.allowed,
            blocked: state.blocked,
            active_buckets: state.buckets.len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
