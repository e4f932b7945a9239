use serde::{Deserialize, Serialize};

use super::{OperationKind, PendingOperation};
use crate::remote::{RemoteError, RemoteErrorKind};

/// 回放失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplayFailureReason {
    /// 网络超时 / 连接断开 - 可重试
    Transport,
    /// 服务端错误 - 5xx 可重试，其余不重试
    ServerError(u16),
    /// 认证失败 - 重新登录后可重试
    AuthFailure,
    /// 限流 - 可重试
    RateLimited,
    /// 目标记录不存在
    NotFound(OperationKind),
    /// 版本冲突 - 不重试
    Conflict,
    /// 数据校验失败 - 不重试
    Validation,
}

impl ReplayFailureReason {
    pub fn classify(error: &RemoteError, kind: OperationKind) -> Self {
        match &error.kind {
            RemoteErrorKind::Transport => ReplayFailureReason::Transport,
            RemoteErrorKind::Server(code) => ReplayFailureReason::ServerError(*code),
            RemoteErrorKind::Unauthorized => ReplayFailureReason::AuthFailure,
            RemoteErrorKind::RateLimited => ReplayFailureReason::RateLimited,
            RemoteErrorKind::NotFound => ReplayFailureReason::NotFound(kind),
            RemoteErrorKind::Conflict => ReplayFailureReason::Conflict,
            RemoteErrorKind::Validation => ReplayFailureReason::Validation,
        }
    }

    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayFailureReason::Transport => true,
            ReplayFailureReason::ServerError(code) => (500..600).contains(code),
            ReplayFailureReason::AuthFailure => true,
            ReplayFailureReason::RateLimited => true,
            // 新增的目标表不存在无法通过重试解决；修改可能在等待远端的新增落地
            ReplayFailureReason::NotFound(kind) => *kind != OperationKind::Create,
            ReplayFailureReason::Conflict => false,
            ReplayFailureReason::Validation => false,
        }
    }
}

/// 单次失败后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 留在队列中，下次同步再试
    Retry,
    /// 移入死信区
    DeadLetter,
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// 最大重试次数（None 表示无限重试）
    pub max_retries: Option<u32>,
    /// 不可重试的失败是否直接移入死信区（否则保留在队列中）
    pub dead_letter_non_retryable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            dead_letter_non_retryable: false,
        }
    }
}

impl RetryPolicy {
    /// 无上限重试，失败的操作永远留在队列中
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            dead_letter_non_retryable: false,
        }
    }

    /// `op.retry_count` 应已包含本次失败
    pub fn decide(&self, op: &PendingOperation, reason: &ReplayFailureReason) -> RetryDecision {
        if !reason.is_retryable() && self.dead_letter_non_retryable {
            return RetryDecision::DeadLetter;
        }
        match self.max_retries {
            Some(max) if op.retry_count >= max => RetryDecision::DeadLetter,
            _ => RetryDecision::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(ReplayFailureReason::Transport.is_retryable());
        assert!(ReplayFailureReason::ServerError(503).is_retryable());
        assert!(!ReplayFailureReason::ServerError(418).is_retryable());
        assert!(ReplayFailureReason::AuthFailure.is_retryable());
        assert!(ReplayFailureReason::RateLimited.is_retryable());
        assert!(ReplayFailureReason::NotFound(OperationKind::Update).is_retryable());
        assert!(!ReplayFailureReason::NotFound(OperationKind::Create).is_retryable());
        assert!(!ReplayFailureReason::Conflict.is_retryable());
        assert!(!ReplayFailureReason::Validation.is_retryable());
    }

    #[test]
    fn test_classify() {
        let reason = ReplayFailureReason::classify(
            &RemoteError::not_found("patients/P2"),
            OperationKind::Update,
        );
        assert_eq!(reason, ReplayFailureReason::NotFound(OperationKind::Update));
    }

    #[test]
    fn test_retry_cap() {
        let policy = RetryPolicy {
            max_retries: Some(3),
            ..RetryPolicy::default()
        };
        let mut op = PendingOperation::update("patients", "P2", json!({"name": "Bo"}));
        let reason = ReplayFailureReason::Transport;

        op.record_failure("timeout");
        assert_eq!(policy.decide(&op, &reason), RetryDecision::Retry);
        op.record_failure("timeout");
        op.record_failure("timeout");
        assert_eq!(policy.decide(&op, &reason), RetryDecision::DeadLetter);

        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Conflict),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_default_keeps_non_retryable_queued_until_cap() {
        let policy = RetryPolicy::default();
        let mut op = PendingOperation::update("patients", "P2", json!({"name": "Bo"}));

        op.record_failure("invalid payload");
        assert_eq!(op.retry_count, 1);
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Validation),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Conflict),
            RetryDecision::Retry
        );

        for _ in 1..10 {
            op.record_failure("invalid payload");
        }
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Validation),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_strict_policy_dead_letters_non_retryable() {
        let policy = RetryPolicy {
            dead_letter_non_retryable: true,
            ..RetryPolicy::default()
        };
        let mut op = PendingOperation::update("patients", "P2", json!({}));
        op.record_failure("version changed");
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Conflict),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_unbounded_keeps_everything_queued() {
        let policy = RetryPolicy::unbounded();
        let mut op = PendingOperation::update("patients", "P2", json!({}));
        for _ in 0..100 {
            op.record_failure("timeout");
        }
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Transport),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.decide(&op, &ReplayFailureReason::Validation),
            RetryDecision::Retry
        );
    }
}
