use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod reload;
pub mod watcher;

pub use crate::config::{ReloaderConfig, CONFIG_FILE};
pub use crate::core::{PushEngine, PushReport, PushStatus, TcpSender, TransferKind};
pub use crate::error::{HotpushError, Result};
pub use crate::reload::{Orchestrator, ReloadAction};

use crate::core::fingerprint::scan;
use crate::core::transport::ReceiverServer;
use crate::reload::{DigestModuleLoader, HeadlessHost, NativeProcess, RuntimeRegistry};
use crate::watcher::ProjectWatcher;

/// 命令行使用的编排器
pub type CliOrchestrator = Orchestrator<HeadlessHost, NativeProcess>;

/// 应用状态，监听循环和接收循环共享
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: ReloaderConfig,
    /// 退出信号
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn load(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| HotpushError::io(root, e))?;
        let config = ReloaderConfig::load(&root)?;
        tracing::debug!("项目目录: {:?}", root);
        Ok(Self {
            root,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// 推送引擎，目标为配置中的全部设备
    pub fn push_engine(&self) -> PushEngine {
        let sender = TcpSender::new(
            self.config.reloader_port,
            self.config.connect_timeout(),
            self.config.ack_timeout(),
        );
        PushEngine::new(
            &self.root,
            self.config.exclusion_rules(),
            Arc::new(sender),
            self.config.phone_ips.clone(),
        )
    }

    pub fn orchestrator(&self) -> CliOrchestrator {
        let compile = self.config.service_compile_command.clone();
        let process = if self.config.app_command.is_empty() {
            NativeProcess::reexec(compile)
        } else {
            NativeProcess::managed(compile)
        };

        let orchestrator = Orchestrator::new(
            &self.root,
            self.config.reload_rules(),
            RuntimeRegistry::in_memory(),
            Box::new(DigestModuleLoader),
            HeadlessHost::default(),
            process,
        );
        if self.config.app_command.is_empty() {
            orchestrator
        } else {
            orchestrator.with_restart_argv(self.config.app_command.clone())
        }
    }

    /// 导入项目模块，并在配置了应用命令时启动应用
    async fn prepare_orchestrator(&self) -> anyhow::Result<CliOrchestrator> {
        let mut orchestrator = self.orchestrator();

        let root = self.root.clone();
        let filter = self.config.watch_filter();
        let snapshot = tokio::task::spawn_blocking(move || scan(&root, &filter)).await?;
        let imported = orchestrator.import_modules(snapshot.paths());
        tracing::info!("已加载 {} 个模块", imported);

        if !self.config.app_command.is_empty() {
            orchestrator
                .process_mut()
                .launch(&self.config.app_command)?;
        }
        Ok(orchestrator)
    }

    /// 桌面端：监听文件变化，推送到设备并在本地重载
    pub async fn run_watch(&self) -> anyhow::Result<()> {
        self.config.validate()?;

        let mut engine = if self.config.hot_reload_on_phone {
            if self.config.phone_ips.is_empty() {
                tracing::warn!("hot_reload_on_phone 已开启但没有配置 phone_ips，只在本地重载");
                None
            } else {
                Some(self.push_engine())
            }
        } else {
            None
        };

        let mut orchestrator = self.prepare_orchestrator().await?;
        let mut debouncer =
            ProjectWatcher::start(&self.root, &self.config)?.into_debouncer(self.config.debounce());

        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = debouncer.next_batch() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            orchestrator.run_desktop_cycle(&batch, engine.as_mut()).await;
        }

        tracing::info!("监听已停止");
        Ok(())
    }

    /// 设备端：接收压缩包，解包后重载
    pub async fn run_serve(&self, host: &str) -> anyhow::Result<()> {
        let mut orchestrator = self.prepare_orchestrator().await?;

        let server = ReceiverServer::bind(host, self.config.reloader_port).await?;
        let (tx, mut rx) = mpsc::channel(4);
        let server_task = tokio::spawn(server.run(tx, self.cancel.clone()));

        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = rx.recv() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            // 处理完一个压缩包才接收下一个
            orchestrator.handle_incoming(incoming).await;
        }

        self.cancel.cancel();
        server_task.await?;
        Ok(())
    }

    /// 通知所有循环退出
    pub fn shutdown(&self) {
        tracing::info!("正在退出...");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_push_apply_reload_end_to_end() {
        let desktop = tempfile::tempdir().unwrap();
        let device = tempfile::tempdir().unwrap();
        write(desktop.path(), "screens/home.py", "class HomeScreen");
        write(desktop.path(), "util.py", "X = 1");
        write(desktop.path(), "app.kv", "<HomeScreen>:");
        write(desktop.path(), "data/config.json", "{}");
        write(desktop.path(), "screens/home.pyc", "bytecode");

        let server = ReceiverServer::bind("127.0.0.1", 0).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(server.run(tx, cancel.clone()));

        let device_state = AppState {
            root: device.path().to_path_buf(),
            config: ReloaderConfig::default(),
            cancel: cancel.clone(),
        };
        let desktop_state = AppState {
            root: desktop.path().to_path_buf(),
            config: ReloaderConfig {
                phone_ips: vec!["127.0.0.1".to_string()],
                reloader_port: port,
                ..Default::default()
            },
            cancel: cancel.clone(),
        };
        let mut engine = desktop_state.push_engine();
        let mut orchestrator = device_state.orchestrator();

        // 第一次：完整推送
        let (report, action) = tokio::join!(engine.run_once(), async {
            let incoming = rx.recv().await.unwrap();
            orchestrator.handle_incoming(incoming).await
        });
        let report = report.unwrap();
        assert_eq!(report.kind, Some(TransferKind::Full));
        assert!(report.committed);
        assert!(matches!(action, Some(ReloadAction::ModuleReload { .. })));
        assert_eq!(
            fs::read_to_string(device.path().join("screens/home.py")).unwrap(),
            "class HomeScreen"
        );
        assert!(!device.path().join("screens/home.pyc").exists());
        assert_eq!(orchestrator.host().rebuilds, 1);

        orchestrator.import_modules(["screens/home.py", "util.py"]);

        // 只改布局：增量推送，只重新加载布局
        write(desktop.path(), "app.kv", "<HomeScreen>:\n    size: 10, 10");
        let (report, action) = tokio::join!(engine.run_once(), async {
            let incoming = rx.recv().await.unwrap();
            orchestrator.handle_incoming(incoming).await
        });
        let report = report.unwrap();
        assert_eq!(report.kind, Some(TransferKind::Delta));
        assert_eq!(report.files_sent, 1);
        assert_eq!(
            action,
            Some(ReloadAction::ReloadMarkup {
                files: vec!["app.kv".to_string()]
            })
        );

        // 改模块：模块被重新导入
        write(desktop.path(), "util.py", "X = 2");
        let (report, action) = tokio::join!(engine.run_once(), async {
            let incoming = rx.recv().await.unwrap();
            orchestrator.handle_incoming(incoming).await
        });
        assert!(report.unwrap().committed);
        assert_eq!(
            action,
            Some(ReloadAction::ModuleReload {
                paths: BTreeSet::from(["util.py".to_string()])
            })
        );
        let outcome = orchestrator.last_outcome().unwrap();
        assert_eq!(outcome.reloaded, vec!["util".to_string()]);
        assert_eq!(orchestrator.host().rebuilds, 3);

        cancel.cancel();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_device_keeps_snapshot() {
        let desktop = tempfile::tempdir().unwrap();
        write(desktop.path(), "util.py", "X = 1");
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let state = AppState {
            root: desktop.path().to_path_buf(),
            config: ReloaderConfig {
                phone_ips: vec!["127.0.0.1".to_string()],
                reloader_port: port,
                ..Default::default()
            },
            cancel: CancellationToken::new(),
        };
        let mut engine = state.push_engine();
        let report = engine.run_once().await.unwrap();
        assert!(!report.committed);
        assert!(report.devices[0].error.is_some());
        assert!(engine.committed().is_empty());

        // 重试时差异不变
        let status = engine.status().await.unwrap();
        assert_eq!(status.changes.added.len(), 1);
    }
}
