//! 宿主协作方接口 - UI、声明式布局、进程控制、模块加载
//!
//! 重载引擎只通过这些 trait 与 GUI 框架和操作系统打交道。

use crate::core::fingerprint::calculate_hash;
use crate::reload::registry::{LoadedModule, RuntimeRegistry};
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// UI 宿主
pub trait UiHost {
    /// 清空当前控件树并用顶层构建函数重新构建
    fn rebuild_root_widget(&mut self) -> Result<()>;

    /// 用可滚动的错误视图替换当前 UI
    fn show_error(&mut self, message: &str, trace: &str);
}

/// 声明式布局加载器
pub trait MarkupLoader {
    fn unload(&mut self, path: &Path);

    fn load(&mut self, path: &Path) -> Result<()>;
}

/// 进程控制
pub trait ProcessControl {
    /// 以相同参数重新启动进程
    fn restart_current_process(&mut self, argv: &[String]) -> Result<()>;

    fn terminate(&mut self, pid: u32) -> Result<()>;

    /// 是否可以重启宿主 Activity（仅设备环境）
    fn can_restart_activity(&self) -> bool {
        false
    }

    fn restart_activity(&mut self) -> Result<()> {
        bail!("当前环境不支持重启 Activity")
    }

    /// 删除旧字节码并重新编译服务文件
    fn recompile_service(&mut self, path: &Path) -> Result<()>;

    /// 停止后台服务，成功返回 true
    fn stop_service(&mut self, name: &str) -> bool;
}

/// 模块加载器：执行模块源码并返回它的命名空间
pub trait ModuleLoader {
    fn import(&self, name: &str, path: &Path, registry: &RuntimeRegistry) -> Result<LoadedModule>;
}

/// 重启方式
#[derive(Debug, Clone)]
enum RestartMode {
    /// 用同样的参数替换当前进程
    ReExec,
    /// 应用作为子进程运行，重启时先结束旧的子进程
    Child,
}

/// 本机进程控制
pub struct NativeProcess {
    mode: RestartMode,
    children: Vec<Child>,
    compile_command: Vec<String>,
}

impl NativeProcess {
    /// 重启时替换当前进程
    pub fn reexec(compile_command: Vec<String>) -> Self {
        Self {
            mode: RestartMode::ReExec,
            children: Vec::new(),
            compile_command,
        }
    }

    /// 应用以子进程方式运行
    pub fn managed(compile_command: Vec<String>) -> Self {
        Self {
            mode: RestartMode::Child,
            children: Vec::new(),
            compile_command,
        }
    }

    /// 启动应用子进程并登记
    pub fn launch(&mut self, argv: &[String]) -> Result<u32> {
        let (program, args) = argv.split_first().context("启动命令为空")?;
        let child = Command::new(program)
            .args(args)
            .spawn()
            .with_context(|| format!("启动 {:?} 失败", argv))?;
        let pid = child.id();
        info!("应用已启动: {:?} (pid {})", argv, pid);
        self.children.push(child);
        Ok(pid)
    }

    /// 结束所有登记的子进程
    pub fn terminate_children(&mut self) {
        for mut child in self.children.drain(..) {
            let pid = child.id();
            if let Err(e) = child.kill() {
                debug!("子进程 {} 已退出: {}", pid, e);
            }
            let _ = child.wait();
        }
    }

    pub fn child_pids(&self) -> Vec<u32> {
        self.children.iter().map(Child::id).collect()
    }

    #[cfg(unix)]
    fn replace_current(argv: &[String]) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("无法获取当前可执行文件路径")?;
        let args = argv.get(1..).unwrap_or_default();
        info!("重新执行当前进程: {:?} {:?}", exe, args);
        // exec 只在失败时返回
        let err = Command::new(&exe).args(args).exec();
        warn!("exec 失败，改为启动新进程: {}", err);
        Command::new(&exe)
            .args(args)
            .spawn()
            .with_context(|| format!("启动 {:?} 失败", exe))?;
        std::process::exit(0)
    }

    #[cfg(not(unix))]
    fn replace_current(argv: &[String]) -> Result<()> {
        let exe = std::env::current_exe().context("无法获取当前可执行文件路径")?;
        let args = argv.get(1..).unwrap_or_default();
        info!("启动新进程: {:?} {:?}", exe, args);
        // 宿主进程保留下来等待子进程，Ctrl-C 仍能到达新进程
        let status = Command::new(&exe)
            .args(args)
            .status()
            .with_context(|| format!("启动 {:?} 失败", exe))?;
        std::process::exit(status.code().unwrap_or(0))
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        self.terminate_children();
    }
}

impl ProcessControl for NativeProcess {
    fn restart_current_process(&mut self, argv: &[String]) -> Result<()> {
        match self.mode {
            RestartMode::Child => {
                self.terminate_children();
                self.launch(argv).map(|_| ())
            }
            RestartMode::ReExec => {
                self.terminate_children();
                Self::replace_current(argv)
            }
        }
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        if pid == std::process::id() {
            info!("结束当前进程");
            std::process::exit(0);
        }

        if let Some(index) = self.children.iter().position(|c| c.id() == pid) {
            let mut child = self.children.remove(index);
            child.kill().with_context(|| format!("结束子进程 {} 失败", pid))?;
            let _ = child.wait();
            return Ok(());
        }

        let result = if cfg!(windows) {
            Command::new("taskkill")
                .args(["/F", "/PID", &pid.to_string()])
                .status()
        } else {
            Command::new("kill").arg(pid.to_string()).status()
        };
        let status = result.with_context(|| format!("结束进程 {} 失败", pid))?;

        if !status.success() {
            bail!("结束进程 {} 失败: {}", pid, status);
        }
        Ok(())
    }

    fn recompile_service(&mut self, path: &Path) -> Result<()> {
        let mut compiled = path.as_os_str().to_owned();
        compiled.push("c");
        let compiled = PathBuf::from(compiled);
        if compiled.exists() {
            std::fs::remove_file(&compiled)
                .with_context(|| format!("删除 {:?} 失败", compiled))?;
        }

        let Some((program, args)) = self.compile_command.split_first() else {
            debug!("未配置编译命令，跳过重新编译 {:?}", path);
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .arg(path)
            .status()
            .with_context(|| format!("运行编译命令 {:?} 失败", self.compile_command))?;
        if !status.success() {
            bail!("编译 {:?} 失败: {}", path, status);
        }
        info!("已重新编译服务文件 {:?}", path);
        Ok(())
    }

    fn stop_service(&mut self, name: &str) -> bool {
        // 桌面端服务与应用在同一进程中运行，重启进程即可
        warn!("当前平台没有独立的服务进程可停止: {}", name);
        false
    }
}

/// 无界面宿主：用于命令行接收端，所有 UI 操作只记录日志
#[derive(Debug, Default)]
pub struct HeadlessHost {
    pub rebuilds: usize,
    pub errors: Vec<(String, String)>,
    pub markup: BTreeSet<PathBuf>,
}

impl UiHost for HeadlessHost {
    fn rebuild_root_widget(&mut self) -> Result<()> {
        self.rebuilds += 1;
        info!("根控件已重建 (第 {} 次)", self.rebuilds);
        Ok(())
    }

    fn show_error(&mut self, message: &str, trace: &str) {
        error!("重载失败: {}\n{}", message, trace);
        self.errors.push((message.to_string(), trace.to_string()));
    }
}

impl MarkupLoader for HeadlessHost {
    fn unload(&mut self, path: &Path) {
        if self.markup.remove(path) {
            debug!("已卸载布局 {:?}", path);
        }
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        std::fs::metadata(path).with_context(|| format!("布局文件不存在: {:?}", path))?;
        self.markup.insert(path.to_path_buf());
        info!("已加载布局 {:?}", path);
        Ok(())
    }
}

/// 只记录源码指纹的模块加载器，供无界面接收端使用
#[derive(Debug, Default)]
pub struct DigestModuleLoader;

impl ModuleLoader for DigestModuleLoader {
    fn import(&self, name: &str, path: &Path, _registry: &RuntimeRegistry) -> Result<LoadedModule> {
        let data = std::fs::read(path).with_context(|| format!("读取模块 {} 失败", name))?;
        let mut module = LoadedModule::new(name, path);
        module
            .exports
            .insert("__digest__".to_string(), calculate_hash(&data));
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_markup_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let kv = dir.path().join("screen.kv");
        let mut host = HeadlessHost::default();
        assert!(host.load(&kv).is_err());

        std::fs::write(&kv, "<Screen>:").unwrap();
        host.load(&kv).unwrap();
        assert!(host.markup.contains(&kv));
        host.unload(&kv);
        assert!(host.markup.is_empty());
    }

    #[test]
    fn test_digest_loader_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "A = 1").unwrap();
        let registry = RuntimeRegistry::in_memory();

        let first = DigestModuleLoader.import("a", &path, &registry).unwrap();
        std::fs::write(&path, "A = 2").unwrap();
        let second = DigestModuleLoader.import("a", &path, &registry).unwrap();
        assert_ne!(first.export("__digest__"), second.export("__digest__"));
    }

    #[cfg(unix)]
    #[test]
    fn test_managed_restart_replaces_child() {
        let mut process = NativeProcess::managed(Vec::new());
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let first = process.launch(&argv).unwrap();
        process.restart_current_process(&argv).unwrap();
        let pids = process.child_pids();
        assert_eq!(pids.len(), 1);
        assert_ne!(pids[0], first);
        process.terminate(pids[0]).unwrap();
        assert!(process.child_pids().is_empty());
    }

    #[test]
    fn test_recompile_without_command_removes_bytecode() {
        let dir = tempfile::tempdir().unwrap();
        let service = dir.path().join("service.py");
        let compiled = dir.path().join("service.pyc");
        std::fs::write(&service, "x = 1").unwrap();
        std::fs::write(&compiled, "bytecode").unwrap();

        let mut process = NativeProcess::managed(Vec::new());
        process.recompile_service(&service).unwrap();
        assert!(!compiled.exists());
    }
}
