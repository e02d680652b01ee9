//! 重载编排器
//!
//! 每个变更批次走一遍 IDLE → PACKAGING → TRANSFERRING → APPLYING → RELOADING → IDLE，
//! 桌面端跳过 APPLYING，设备端跳过 PACKAGING / TRANSFERRING。
//! 一个批次处理完回到 IDLE 之前不会开始下一个批次。

use crate::core::archive::{apply_archive, AppliedChangeSet};
use crate::core::engine::PushEngine;
use crate::core::exclusion::glob_matches;
use crate::core::transport::IncomingArchive;
use crate::reload::host::{MarkupLoader, ModuleLoader, ProcessControl, UiHost};
use crate::reload::invalidator::{path_to_module, ModuleInvalidator, ReloadOutcome};
use crate::reload::registry::RuntimeRegistry;
use anyhow::Context;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// 编排阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Packaging,
    Transferring,
    Applying,
    Reloading,
}

/// 后台服务：名称与入口文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub file: String,
}

/// 变更批次对应的重载动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadAction {
    /// 没有变更
    Noop,
    /// 重启进程
    RestartProcess { trigger: String },
    /// 重新编译并停止服务，然后重启进程
    RestartService { services: Vec<ServiceSpec> },
    /// 只重新加载布局文件
    ReloadMarkup { files: Vec<String> },
    /// 失效并重新导入模块，然后重建根控件
    ModuleReload { paths: BTreeSet<String> },
}

impl fmt::Display for ReloadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadAction::Noop => write!(f, "NOOP"),
            ReloadAction::RestartProcess { .. } => write!(f, "RESTART_PROCESS"),
            ReloadAction::RestartService { .. } => {
                write!(f, "RECOMPILE_SERVICE + STOP_SERVICE + RESTART_PROCESS")
            }
            ReloadAction::ReloadMarkup { .. } => write!(f, "RELOAD_MARKUP_ONLY"),
            ReloadAction::ModuleReload { .. } => write!(f, "MODULE_RELOAD"),
        }
    }
}

/// 分类规则
#[derive(Debug, Clone)]
pub struct ReloadRules {
    /// 修改后需要重启进程的文件（glob，按完整相对路径匹配）
    pub full_reload_files: Vec<String>,
    pub services: Vec<ServiceSpec>,
    pub module_extensions: Vec<String>,
    pub markup_extensions: Vec<String>,
    pub main_module: String,
}

impl Default for ReloadRules {
    fn default() -> Self {
        Self {
            full_reload_files: vec!["main.py".to_string()],
            services: Vec::new(),
            module_extensions: vec!["py".to_string()],
            markup_extensions: vec!["kv".to_string()],
            main_module: "main".to_string(),
        }
    }
}

impl ReloadRules {
    fn is_full_reload(&self, path: &str) -> bool {
        self.full_reload_files.iter().any(|p| glob_matches(p, path))
            || path_to_module(path, &self.module_extensions).as_deref()
                == Some(self.main_module.as_str())
    }

    fn is_markup(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .is_some_and(|(_, ext)| self.markup_extensions.iter().any(|e| e == ext))
    }

    fn is_module(&self, path: &str) -> bool {
        path_to_module(path, &self.module_extensions).is_some()
    }
}

/// 按优先级对变更批次分类
///
/// 1. 入口文件或完整重载文件 → 重启进程
/// 2. 服务文件 → 重新编译服务、停止服务、重启进程
/// 3. 只有布局文件变化 → 只重新加载布局
/// 4. 其他 → 模块重载
pub fn classify(changed: &BTreeSet<String>, rules: &ReloadRules) -> ReloadAction {
    if changed.is_empty() {
        return ReloadAction::Noop;
    }

    if let Some(trigger) = changed.iter().find(|p| rules.is_full_reload(p)) {
        return ReloadAction::RestartProcess {
            trigger: trigger.clone(),
        };
    }

    let services: Vec<ServiceSpec> = rules
        .services
        .iter()
        .filter(|s| changed.iter().any(|p| glob_matches(&s.file, p)))
        .cloned()
        .collect();
    if !services.is_empty() {
        return ReloadAction::RestartService { services };
    }

    let markup: Vec<String> = changed.iter().filter(|p| rules.is_markup(p)).cloned().collect();
    if !markup.is_empty() && !changed.iter().any(|p| rules.is_module(p)) {
        return ReloadAction::ReloadMarkup { files: markup };
    }

    ReloadAction::ModuleReload {
        paths: changed.clone(),
    }
}

/// 重载编排器
pub struct Orchestrator<H, P>
where
    H: UiHost + MarkupLoader,
    P: ProcessControl,
{
    phase: Phase,
    rules: ReloadRules,
    invalidator: ModuleInvalidator,
    registry: RuntimeRegistry,
    loader: Box<dyn ModuleLoader>,
    host: H,
    process: P,
    restart_argv: Vec<String>,
    last_outcome: Option<ReloadOutcome>,
}

impl<H, P> Orchestrator<H, P>
where
    H: UiHost + MarkupLoader,
    P: ProcessControl,
{
    pub fn new(
        root: impl Into<PathBuf>,
        rules: ReloadRules,
        registry: RuntimeRegistry,
        loader: Box<dyn ModuleLoader>,
        host: H,
        process: P,
    ) -> Self {
        let invalidator = ModuleInvalidator::new(
            root,
            &rules.main_module,
            rules.module_extensions.clone(),
        );
        Self {
            phase: Phase::Idle,
            rules,
            invalidator,
            registry,
            loader,
            host,
            process,
            restart_argv: std::env::args().collect(),
            last_outcome: None,
        }
    }

    /// 重启进程时使用的参数（默认为当前进程参数）
    pub fn with_restart_argv(mut self, argv: Vec<String>) -> Self {
        self.restart_argv = argv;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RuntimeRegistry {
        &mut self.registry
    }

    pub fn rules(&self) -> &ReloadRules {
        &self.rules
    }

    /// 最近一次模块重载的结果
    pub fn last_outcome(&self) -> Option<&ReloadOutcome> {
        self.last_outcome.as_ref()
    }

    /// 导入项目中的模块，之后它们的变更才会触发模块重载
    pub fn import_modules<'a>(&mut self, rel_paths: impl IntoIterator<Item = &'a str>) -> usize {
        self.invalidator
            .import_all(rel_paths, &mut self.registry, self.loader.as_ref())
    }

    fn enter(&mut self, phase: Phase) {
        debug!("阶段 {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn classify(&self, changed: &BTreeSet<String>) -> ReloadAction {
        classify(changed, &self.rules)
    }

    /// 桌面端一个批次：先推送到设备，再在本地重载
    ///
    /// 打包失败时本批次到此为止；传输失败只记录，本地重载照常进行。
    pub async fn run_desktop_cycle(
        &mut self,
        changed: &BTreeSet<String>,
        engine: Option<&mut PushEngine>,
    ) -> ReloadAction {
        let action = self.classify(changed);
        info!("变更批次 {} 个文件 -> {}", changed.len(), action);

        if let Some(engine) = engine {
            if !self.push(engine).await {
                self.enter(Phase::Idle);
                return action;
            }
        }

        self.reload_with(&action);
        action
    }

    /// 推送到设备；只有打包失败时返回 false
    async fn push(&mut self, engine: &mut PushEngine) -> bool {
        self.enter(Phase::Packaging);
        let prepared = match engine.prepare().await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return true,
            Err(e) => {
                error!("打包失败，本次变更不会推送: {}", e);
                return false;
            }
        };

        self.enter(Phase::Transferring);
        match engine.push(prepared).await {
            Ok(report) if !report.committed => {
                warn!("设备未全部确认，下次变更时会重新发送");
            }
            Ok(_) => {}
            Err(e) => error!("推送失败: {}", e),
        }
        true
    }

    /// 设备端处理一个收到的压缩包：解包、确认、重载
    pub async fn handle_incoming(&mut self, mut incoming: IncomingArchive) -> Option<ReloadAction> {
        self.enter(Phase::Applying);
        let root = self.invalidator.root().to_path_buf();
        let peer = incoming.peer;
        let data = std::mem::take(&mut incoming.data);

        let applied = tokio::task::spawn_blocking(move || apply_archive(&root, &data)).await;
        let applied: AppliedChangeSet = match applied {
            Ok(Ok(applied)) => applied,
            Ok(Err(e)) => {
                error!("应用来自 {} 的更新失败: {}", peer, e);
                incoming.acknowledge(false).await;
                self.enter(Phase::Idle);
                return None;
            }
            Err(e) => {
                error!("解包任务异常退出: {}", e);
                incoming.acknowledge(false).await;
                self.enter(Phase::Idle);
                return None;
            }
        };

        // 等 OK 写完再重载，重启进程时确认已经交给内核
        if !incoming.acknowledge(true).await {
            warn!("确认未能送达 {}，发送端会重新推送", peer);
        }

        let changed = applied.changed_paths();
        let action = self.classify(&changed);
        info!("收到 {} 更新 -> {}", applied.kind, action);
        self.reload_with(&action);
        Some(action)
    }

    /// 对变更批次执行重载（不推送），返回执行的动作
    pub fn reload(&mut self, changed: &BTreeSet<String>) -> ReloadAction {
        let action = self.classify(changed);
        self.reload_with(&action);
        action
    }

    fn reload_with(&mut self, action: &ReloadAction) {
        self.enter(Phase::Reloading);
        if let Err(e) = self.execute(action) {
            error!("重载失败 ({}): {:#}", action, e);
            let trace = e
                .chain()
                .skip(1)
                .map(|c| format!("caused by: {}", c))
                .collect::<Vec<_>>()
                .join("\n");
            self.host.show_error(&e.to_string(), &trace);
        }
        self.enter(Phase::Idle);
    }

    fn execute(&mut self, action: &ReloadAction) -> anyhow::Result<()> {
        match action {
            ReloadAction::Noop => Ok(()),
            ReloadAction::RestartProcess { trigger } => {
                info!("{} 已修改，重启应用", trigger);
                self.restart()
            }
            ReloadAction::RestartService { services } => {
                for service in services {
                    info!("服务 {} 已更新", service.name);
                    let path = self.invalidator.root().join(&service.file);
                    self.process
                        .recompile_service(&path)
                        .with_context(|| format!("重新编译服务 {} 失败", service.name))?;
                    if !self.process.stop_service(&service.name) {
                        warn!("停止服务 {} 失败，仍然重启应用", service.name);
                    }
                }
                self.restart()
            }
            ReloadAction::ReloadMarkup { files } => {
                self.reload_markup(files.iter())?;
                self.host.rebuild_root_widget().context("重建根控件失败")
            }
            ReloadAction::ModuleReload { paths } => {
                let markup: Vec<&String> = paths.iter().filter(|p| self.rules.is_markup(p)).collect();
                let outcome = self.invalidator.invalidate_and_reload(
                    paths,
                    &mut self.registry,
                    self.loader.as_ref(),
                );
                for failure in outcome.final_failures() {
                    warn!("模块 {} 仍然无法导入: {}", failure.module, failure.error);
                }
                self.last_outcome = Some(outcome);
                self.reload_markup(markup.into_iter())?;
                self.host.rebuild_root_widget().context("重建根控件失败")
            }
        }
    }

    fn reload_markup<'a>(&mut self, files: impl Iterator<Item = &'a String>) -> anyhow::Result<()> {
        for rel in files {
            let path = self.invalidator.root().join(rel);
            self.host.unload(&path);
            if !path.exists() {
                info!("布局文件 {} 已删除", rel);
                continue;
            }
            self.host
                .load(&path)
                .with_context(|| format!("加载布局 {} 失败", rel))?;
        }
        Ok(())
    }

    fn restart(&mut self) -> anyhow::Result<()> {
        if self.process.can_restart_activity() {
            self.process.restart_activity()?;
            return self.process.terminate(std::process::id());
        }
        let argv = self.restart_argv.clone();
        self.process.restart_current_process(&argv)
    }
}
