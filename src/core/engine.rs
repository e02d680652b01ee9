//! 推送引擎 - 扫描、比较、打包、发送、提交
//!
//! 提交快照是整条链路上唯一持久化状态的地方，而且只在所有目标设备都确认之后
//! 发生。任何一台设备失败都不提交，下一次变更会基于同一个旧快照重新计算。

use crate::core::archive::{build_archive, BuiltArchive};
use crate::core::comparator::{diff, ChangeSet};
use crate::core::exclusion::ExclusionRules;
use crate::core::fingerprint::{scan, FingerprintStore, ProjectSnapshot, STATE_DIR};
use crate::core::strategy::{choose, TransferKind};
use crate::core::transport::ArchiveSink;
use crate::error::{HotpushError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 发送端压缩包文件名
pub const ARCHIVE_NAME: &str = "app_copy.zip";

/// 一次推送的准备结果（已打包，尚未发送）
#[derive(Debug, Clone)]
pub struct PreparedPush {
    pub transfer_id: String,
    /// 本次扫描得到的快照，全部设备确认后提交
    pub snapshot: ProjectSnapshot,
    pub changes: ChangeSet,
    pub kind: TransferKind,
    pub archive: BuiltArchive,
}

/// 单台设备的推送结果
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    pub device: String,
    pub acknowledged: bool,
    pub bytes: u64,
    pub error: Option<String>,
}

/// 推送报告
#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub transfer_id: String,
    pub kind: Option<TransferKind>,
    pub files_sent: usize,
    pub files_deleted: usize,
    pub devices: Vec<DeviceOutcome>,
    pub committed: bool,
    pub duration_ms: u64,
}

impl PushReport {
    fn nothing_to_send(started: Instant) -> Self {
        Self {
            transfer_id: String::new(),
            kind: None,
            files_sent: 0,
            files_deleted: 0,
            devices: Vec::new(),
            committed: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// 没有需要发送的变更
    pub fn is_noop(&self) -> bool {
        self.kind.is_none()
    }

    pub fn all_acknowledged(&self) -> bool {
        !self.devices.is_empty() && self.devices.iter().all(|d| d.acknowledged)
    }
}

/// 当前工作区与已提交快照的差异（不打包）
#[derive(Debug, Clone)]
pub struct PushStatus {
    pub changes: ChangeSet,
    pub kind: TransferKind,
    pub total_files: usize,
}

/// 推送引擎
pub struct PushEngine {
    store: FingerprintStore,
    exclusions: Arc<ExclusionRules>,
    sink: Arc<dyn ArchiveSink>,
    devices: Vec<String>,
    archive_path: PathBuf,
}

impl PushEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        exclusions: ExclusionRules,
        sink: Arc<dyn ArchiveSink>,
        devices: Vec<String>,
    ) -> Self {
        let root = root.into();
        let archive_path = root.join(STATE_DIR).join(ARCHIVE_NAME);
        Self {
            store: FingerprintStore::open(root),
            exclusions: Arc::new(exclusions),
            sink,
            devices,
            archive_path,
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn committed(&self) -> &ProjectSnapshot {
        self.store.last()
    }

    fn ensure_devices(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(HotpushError::Config("没有配置任何设备地址".to_string()));
        }
        Ok(())
    }

    /// 在阻塞线程池中扫描项目
    async fn scan_project(&self) -> Result<ProjectSnapshot> {
        let root = self.store.root().to_path_buf();
        let exclusions = self.exclusions.clone();
        let snapshot = tokio::task::spawn_blocking(move || scan(&root, &exclusions)).await?;
        Ok(snapshot)
    }

    /// 计算当前差异和将采用的推送方式
    pub async fn status(&self) -> Result<PushStatus> {
        let snapshot = self.scan_project().await?;
        let changes = diff(self.store.last(), &snapshot);
        let kind = choose(&changes, snapshot.len());
        Ok(PushStatus {
            changes,
            kind,
            total_files: snapshot.len(),
        })
    }

    /// 扫描、比较并打包；没有变更时返回 None
    ///
    /// 扫描完成后才开始比较，打包使用扫描时的路径列表。
    pub async fn prepare(&self) -> Result<Option<PreparedPush>> {
        let snapshot = self.scan_project().await?;
        let changes = diff(self.store.last(), &snapshot);

        if changes.is_empty() {
            info!("没有检测到变更，跳过推送");
            return Ok(None);
        }
        changes.log_trees();

        let kind = choose(&changes, snapshot.len());
        let files: BTreeSet<String> = match kind {
            TransferKind::Delta => changes.changed_files(),
            TransferKind::Full => snapshot.paths().map(str::to_string).collect(),
        };
        let deleted = changes.deleted.clone();

        let root = self.store.root().to_path_buf();
        let output = self.archive_path.clone();
        let archive = tokio::task::spawn_blocking(move || {
            build_archive(&root, &output, kind, &files, &deleted)
        })
        .await??;

        Ok(Some(PreparedPush {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            snapshot,
            changes,
            kind,
            archive,
        }))
    }

    /// 发送到所有设备，全部确认后提交快照
    pub async fn push(&mut self, prepared: PreparedPush) -> Result<PushReport> {
        let started = Instant::now();

        // 无论结果如何，本次的压缩包都不再需要
        let archive_path = prepared.archive.path.clone();
        scopeguard::defer! {
            if let Err(e) = std::fs::remove_file(&archive_path) {
                debug!("删除压缩包 {:?} 失败: {}", archive_path, e);
            }
        }

        self.ensure_devices()?;

        info!(
            "开始推送 {} ({} 包) 到 {} 台设备",
            prepared.transfer_id,
            prepared.kind,
            self.devices.len()
        );

        let mut outcomes = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let outcome = match self.sink.deliver(device, &prepared.archive.path).await {
                Ok(bytes) => DeviceOutcome {
                    device: device.clone(),
                    acknowledged: true,
                    bytes,
                    error: None,
                },
                Err(e) => {
                    error!("推送到 {} 失败: {}", device, e);
                    DeviceOutcome {
                        device: device.clone(),
                        acknowledged: false,
                        bytes: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let mut report = PushReport {
            transfer_id: prepared.transfer_id,
            kind: Some(prepared.kind),
            files_sent: prepared.archive.manifest.files.len() - prepared.archive.skipped.len(),
            files_deleted: prepared.archive.manifest.deleted_files.len(),
            devices: outcomes,
            committed: false,
            duration_ms: 0,
        };

        if report.all_acknowledged() {
            self.store.commit(prepared.snapshot)?;
            report.committed = true;
        } else {
            warn!("并非所有设备都确认了更新，快照未提交，下次变更将重新计算");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "推送结束: {} 个文件, {} 个删除, 已提交: {}, 耗时 {}ms",
            report.files_sent, report.files_deleted, report.committed, report.duration_ms
        );
        Ok(report)
    }

    /// prepare + push
    pub async fn run_once(&mut self) -> Result<PushReport> {
        let started = Instant::now();
        self.ensure_devices()?;
        match self.prepare().await? {
            Some(prepared) => self.push(prepared).await,
            None => Ok(PushReport::nothing_to_send(started)),
        }
    }

    /// 丢弃已提交的快照，下一次推送为完整推送
    pub fn reset(&mut self) -> Result<()> {
        self.store.reset()
    }
}
