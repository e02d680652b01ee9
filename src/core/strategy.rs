//! 推送策略 - 增量包还是完整包

use crate::core::comparator::ChangeSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// 变更比例低于该值时使用增量包
pub const DELTA_CHANGE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Delta,
    Full,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Delta => write!(f, "delta"),
            TransferKind::Full => write!(f, "full"),
        }
    }
}

/// 根据变更比例选择推送方式
///
/// 没有任何文件时总是完整推送；比较是严格小于，恰好 30% 走完整推送。
pub fn choose(changes: &ChangeSet, total_file_count: usize) -> TransferKind {
    if total_file_count == 0 {
        info!("项目中没有文件，使用完整推送");
        return TransferKind::Full;
    }

    let ratio = changes.changed_count() as f64 / total_file_count as f64;
    let kind = if ratio < DELTA_CHANGE_THRESHOLD {
        TransferKind::Delta
    } else {
        TransferKind::Full
    };

    info!(
        "变更比例 {:.1}% (阈值 {:.0}%) - 使用 {} 推送",
        ratio * 100.0,
        DELTA_CHANGE_THRESHOLD * 100.0,
        kind
    );
    kind
}
