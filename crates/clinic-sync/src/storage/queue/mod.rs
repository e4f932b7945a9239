//! 待同步操作队列
//!
//! 离线或即时确认失败的写操作在此排队，网络恢复后由协调器按入队顺序回放。

pub mod pending_op;
pub mod retry_policy;

pub use pending_op::{OperationKind, PendingOperation};
pub use retry_policy::{ReplayFailureReason, RetryDecision, RetryPolicy};

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub dead_lettered: usize,
    /// 至少失败过一次的待同步操作数量
    pub retrying: usize,
}

impl QueueStats {
    pub fn from_ops(queue: &[PendingOperation], dead_letters: &[PendingOperation]) -> Self {
        Self {
            pending: queue.len(),
            dead_lettered: dead_letters.len(),
            retrying: queue.iter().filter(|op| op.retry_count > 0).count(),
        }
    }
}
