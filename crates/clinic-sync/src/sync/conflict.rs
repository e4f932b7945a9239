use serde::{Deserialize, Serialize};

use crate::storage::PendingOperation;

/// 待同步操作回放时的冲突策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// 盲目回放，后写者胜（不发送版本）
    #[default]
    LastWriterWins,
    /// 修改/删除时携带 `base_version`，远端版本不一致返回冲突
    VersionCheck,
}

impl ConflictPolicy {
    /// 回放时发送给远端的期望版本
    pub fn expected_version<'a>(&self, op: &'a PendingOperation) -> Option<&'a str> {
        match self {
            ConflictPolicy::LastWriterWins => None,
            ConflictPolicy::VersionCheck => op.base_version.as_deref(),
        }
    }
}
