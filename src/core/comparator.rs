//! 快照比较 - 计算新增 / 修改 / 删除集合

use crate::core::fingerprint::ProjectSnapshot;
use crate::core::tree::format_file_tree;
use std::collections::BTreeSet;
use tracing::info;

/// 变更集合，三个集合两两不相交
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// |added| + |modified| + |deleted|
    pub fn changed_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// 需要携带内容的文件（新增 ∪ 修改）
    pub fn changed_files(&self) -> BTreeSet<String> {
        self.added.union(&self.modified).cloned().collect()
    }

    /// 所有涉及的路径
    pub fn all_paths(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .cloned()
            .collect()
    }

    /// 以目录树形式输出到日志
    pub fn log_trees(&self) {
        info!("{}", format_file_tree(&self.added, "Added files"));
        info!("{}", format_file_tree(&self.modified, "Modified files"));
        info!("{}", format_file_tree(&self.deleted, "Deleted files"));
    }
}

/// 比较两个快照
///
/// 纯函数：新增 = 新有旧无，删除 = 旧有新无，修改 = 两边都有但 hash 不同。
pub fn diff(old: &ProjectSnapshot, new: &ProjectSnapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (path, hash) in new.iter() {
        match old.get(path) {
            None => {
                changes.added.insert(path.to_string());
            }
            Some(old_hash) if old_hash != hash => {
                changes.modified.insert(path.to_string());
            }
            Some(_) => {}
        }
    }

    for path in old.paths() {
        if !new.contains(path) {
            changes.deleted.insert(path.to_string());
        }
    }

    info!(
        "检测到变更 - 新增: {}, 修改: {}, 删除: {}",
        changes.added.len(),
        changes.modified.len(),
        changes.deleted.len()
    );

    changes
}
