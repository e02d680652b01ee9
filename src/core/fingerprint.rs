//! 文件指纹 - 用于增量推送
//!
//! 快照记录"上一次成功推送到设备的内容"，只能在设备确认之后提交。

use crate::core::exclusion::ExclusionRules;
use crate::core::tree::format_file_tree;
use crate::error::{HotpushError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 项目内部数据目录
pub const STATE_DIR: &str = ".hotpush";
/// 快照文件名
pub const STATE_FILE: &str = "state.json";

/// 计算文件内容的 hash（BLAKE3，取前 16 字节）
pub fn calculate_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    // 32 个十六进制字符，足够检测变化
    hash.to_hex()[..32].to_string()
}

/// 把相对路径转换为统一的 `/` 分隔形式，非 UTF-8 路径返回 None
pub fn normalize_rel_path(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// 项目快照：相对路径 -> 内容 hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectSnapshot(BTreeMap<String, String>);

impl ProjectSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        self.0.insert(path.into(), hash.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for ProjectSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 扫描项目目录，计算每个文件的指纹
///
/// 被排除的目录整棵跳过；读取失败的文件（权限、扫描途中被删除）只记日志，
/// 不出现在快照里。
pub fn scan(root: &Path, exclusions: &ExclusionRules) -> ProjectSnapshot {
    let mut snapshot = ProjectSnapshot::new();
    let mut unnamed_count = 0usize;
    let mut failed_count = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            match entry
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(normalize_rel_path)
            {
                Some(rel) => !exclusions.is_excluded(&rel),
                None => false,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("扫描时跳过无法访问的路径: {}", e);
                failed_count += 1;
                continue;
            }
        };

        if entry.file_type().is_dir() || !entry.path().is_file() {
            continue;
        }

        let Some(rel) = entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(normalize_rel_path)
        else {
            unnamed_count += 1;
            continue;
        };

        match fs::read(entry.path()) {
            Ok(data) => {
                debug!("已扫描: {}", rel);
                snapshot.insert(rel, calculate_hash(&data));
            }
            Err(e) => {
                warn!("读取文件失败，跳过: {} - {}", rel, e);
                failed_count += 1;
            }
        }
    }

    info!(
        "扫描完成: {} 个文件, {} 个读取失败, {} 个路径无法识别",
        snapshot.len(),
        failed_count,
        unnamed_count
    );
    snapshot
}

/// 指纹存储：持久化最后一次提交的快照
pub struct FingerprintStore {
    root: PathBuf,
    state_file: PathBuf,
    last: ProjectSnapshot,
}

impl FingerprintStore {
    /// 打开项目的指纹存储并加载已提交的快照
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_file = root.join(STATE_DIR).join(STATE_FILE);
        let mut store = Self {
            root,
            state_file,
            last: ProjectSnapshot::new(),
        };
        store.last = store.load();
        store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// 最后一次提交的快照
    pub fn last(&self) -> &ProjectSnapshot {
        &self.last
    }

    /// 从磁盘读取已提交的快照；不存在或损坏时返回空快照（等同首次运行）
    pub fn load(&self) -> ProjectSnapshot {
        let content = match fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("没有找到历史快照，将执行完整推送");
                return ProjectSnapshot::new();
            }
            Err(e) => {
                warn!("读取快照失败 {:?}: {}", self.state_file, e);
                return ProjectSnapshot::new();
            }
        };

        match serde_json::from_str::<ProjectSnapshot>(&content) {
            Ok(snapshot) => {
                info!(
                    "{}",
                    format_file_tree(
                        snapshot.paths(),
                        &format!("当前设备状态包含 {} 个文件", snapshot.len())
                    )
                );
                snapshot
            }
            Err(e) => {
                warn!("快照文件已损坏，按首次运行处理: {}", e);
                ProjectSnapshot::new()
            }
        }
    }

    /// 原子地持久化快照（先写临时文件再重命名）
    ///
    /// 只能在设备确认收到并应用对应的压缩包之后调用。
    pub fn commit(&mut self, snapshot: ProjectSnapshot) -> Result<()> {
        let dir = self.root.join(STATE_DIR);
        fs::create_dir_all(&dir).map_err(|e| HotpushError::io(&dir, e))?;

        let content = serde_json::to_string_pretty(&snapshot)?;
        let temp_path = self.state_file.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(|e| HotpushError::io(&temp_path, e))?;
        fs::rename(&temp_path, &self.state_file)
            .map_err(|e| HotpushError::io(&self.state_file, e))?;

        info!("已提交快照: {} 个文件", snapshot.len());
        self.last = snapshot;
        Ok(())
    }

    /// 删除已提交的快照，下一次推送为完整推送
    pub fn reset(&mut self) -> Result<()> {
        match fs::remove_file(&self.state_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HotpushError::io(&self.state_file, e)),
        }
        self.last = ProjectSnapshot::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_hash_is_128_bit_hex() {
        let h1 = calculate_hash(b"hello");
        let h2 = calculate_hash(b"hello");
        let h3 = calculate_hash(b"hello!");
        assert_eq!(h1.len(), 32);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(
            normalize_rel_path(Path::new("screens/a.py")).as_deref(),
            Some("screens/a.py")
        );
        assert_eq!(normalize_rel_path(Path::new("./main.py")).as_deref(), Some("main.py"));
        assert_eq!(normalize_rel_path(Path::new("../x.py")), None);
        assert_eq!(normalize_rel_path(Path::new("")), None);
    }

    #[test]
    fn test_scan_prunes_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "main.py", "print('hi')");
        write(root, "screens/a.py", "a = 1");
        write(root, "screens/__pycache__/a.pyc", "bytecode");
        write(root, ".hotpush/state.json", "{}");
        write(root, "venv/lib/site.py", "x");

        let rules = ExclusionRules::new(["__pycache__", "venv/"]);
        let snapshot = scan(root, &rules);

        let paths: Vec<&str> = snapshot.paths().collect();
        assert_eq!(paths, vec!["main.py", "screens/a.py"]);
        assert_eq!(snapshot.get("screens/a.py"), Some(calculate_hash(b"a = 1").as_str()));
    }

    #[test]
    fn test_load_missing_or_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(dir.path());
        assert!(store.last().is_empty());

        write(dir.path(), ".hotpush/state.json", "{ not json");
        let store = FingerprintStore::open(dir.path());
        assert!(store.last().is_empty());
    }

    #[test]
    fn test_commit_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FingerprintStore::open(dir.path());

        let mut snapshot = ProjectSnapshot::new();
        snapshot.insert("main.py", "aa");
        snapshot.insert("screens/a.py", "bb");
        store.commit(snapshot.clone()).unwrap();
        assert_eq!(store.last(), &snapshot);
        assert!(!store.state_file().with_extension("json.tmp").exists());

        let reopened = FingerprintStore::open(dir.path());
        assert_eq!(reopened.last(), &snapshot);

        // 持久化格式是 path -> hash 的 JSON 对象
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.state_file()).unwrap()).unwrap();
        assert_eq!(raw["screens/a.py"], "bb");
    }

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FingerprintStore::open(dir.path());
        let mut snapshot = ProjectSnapshot::new();
        snapshot.insert("main.py", "aa");
        store.commit(snapshot).unwrap();

        store.reset().unwrap();
        assert!(store.last().is_empty());
        assert!(!store.state_file().exists());
        // 重复删除不报错
        store.reset().unwrap();
    }
}
