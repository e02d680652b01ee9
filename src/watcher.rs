//! 文件监听 - notify 事件过滤与防抖
//!
//! notify 的回调在它自己的线程上触发，这里再用一个独立线程把事件转换为
//! 项目相对路径，通过无界通道交给异步事件循环。防抖在事件循环一侧完成。

use crate::config::ReloaderConfig;
use crate::core::exclusion::ExclusionRules;
use crate::core::fingerprint::normalize_rel_path;
use crate::error::{HotpushError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// 监听线程检查事件循环是否已退出的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn normalize_target(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 判断一个相对路径是否属于监听范围
#[derive(Debug, Clone)]
pub struct WatchFilter {
    files: BTreeSet<String>,
    folders: Vec<String>,
    recursive: Vec<String>,
    ignore: ExclusionRules,
}

impl WatchFilter {
    pub fn new(config: &ReloaderConfig) -> Self {
        Self {
            files: config.watched_files.iter().map(|f| normalize_target(f)).collect(),
            folders: config.watched_folders.iter().map(|f| normalize_target(f)).collect(),
            recursive: config
                .watched_folders_recursively
                .iter()
                .map(|f| normalize_target(f))
                .collect(),
            ignore: config.watch_filter(),
        }
    }

    pub fn is_relevant(&self, rel_path: &str) -> bool {
        if self.ignore.is_excluded(rel_path) {
            return false;
        }
        if self.files.contains(rel_path) {
            return true;
        }

        let parent = rel_path.rsplit_once('/').map(|(p, _)| p).unwrap_or(".");
        if self.folders.iter().any(|f| f == parent) {
            return true;
        }

        self.recursive.iter().any(|f| {
            f == "." || rel_path.strip_prefix(f.as_str()).is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// 项目文件监听器
///
/// 丢弃接收端后监听线程会在下一个检查周期退出。
pub struct ProjectWatcher {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ProjectWatcher {
    pub fn start(root: &Path, config: &ReloaderConfig) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| HotpushError::io(root, e))?;
        let filter = WatchFilter::new(config);

        let (sync_tx, sync_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(sync_tx)
            .map_err(|e| HotpushError::Config(format!("无法创建文件监听器: {}", e)))?;

        let targets = config
            .watched_files
            .iter()
            .map(|f| (f, RecursiveMode::NonRecursive))
            .chain(
                config
                    .watched_folders
                    .iter()
                    .map(|f| (f, RecursiveMode::NonRecursive)),
            )
            .chain(
                config
                    .watched_folders_recursively
                    .iter()
                    .map(|f| (f, RecursiveMode::Recursive)),
            );

        let mut watched = 0;
        for (target, mode) in targets {
            let path = root.join(normalize_target(target));
            if !path.exists() {
                warn!("监听目标不存在，已跳过: {:?}", path);
                continue;
            }
            match watcher.watch(&path, mode) {
                Ok(()) => {
                    debug!("监听 {:?} ({:?})", path, mode);
                    watched += 1;
                }
                Err(e) => warn!("无法监听 {:?}: {}", path, e),
            }
        }
        if watched == 0 {
            return Err(HotpushError::Config("没有可监听的目标".to_string()));
        }
        info!("开始监听 {} 个目标: {:?}", watched, root);

        let (tx, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("hotpush-watcher".to_string())
            .spawn(move || forward_events(watcher, sync_rx, tx, root, filter))
            .map_err(|e| HotpushError::io("hotpush-watcher", e))?;

        Ok(Self { rx })
    }

    pub fn into_debouncer(self, window: Duration) -> Debouncer {
        Debouncer::new(self.rx, window)
    }
}

fn forward_events(
    // 持有监听器直到线程退出
    _watcher: RecommendedWatcher,
    sync_rx: std_mpsc::Receiver<notify::Result<Event>>,
    tx: mpsc::UnboundedSender<String>,
    root: PathBuf,
    filter: WatchFilter,
) {
    loop {
        let event = match sync_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                error!("文件监听出错: {}", e);
                continue;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
                continue;
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        trace!("收到事件: {:?}", event);
        if matches!(event.kind, EventKind::Access(_)) {
            continue;
        }

        for path in &event.paths {
            if path.is_dir() {
                continue;
            }
            let Some(rel) = path
                .strip_prefix(&root)
                .ok()
                .and_then(normalize_rel_path)
            else {
                continue;
            };
            if !filter.is_relevant(&rel) {
                continue;
            }
            if tx.send(rel).is_err() {
                debug!("事件循环已退出，停止监听");
                return;
            }
        }
    }
    debug!("监听线程退出");
}

/// 尾沿防抖：收到第一个事件后，直到连续 `window` 内没有新事件才交出整批路径
pub struct Debouncer {
    rx: mpsc::UnboundedReceiver<String>,
    window: Duration,
}

impl Debouncer {
    pub fn new(rx: mpsc::UnboundedReceiver<String>, window: Duration) -> Self {
        Self { rx, window }
    }

    /// 等待下一批变更；监听结束时返回 None
    pub async fn next_batch(&mut self) -> Option<BTreeSet<String>> {
        let first = self.rx.recv().await?;
        let mut batch = BTreeSet::from([first]);

        loop {
            match timeout(self.window, self.rx.recv()).await {
                Ok(Some(path)) => {
                    batch.insert(path);
                }
                Ok(None) | Err(_) => break,
            }
        }

        debug!("防抖后得到 {} 个变更文件", batch.len());
        Some(batch)
    }
}
