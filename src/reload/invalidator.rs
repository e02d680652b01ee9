//! 模块失效器 - 卸载变更的模块并分两轮重新导入
//!
//! 第一轮导入时，依赖的模块可能还没刷新，导入可能失败或拿到旧引用；
//! 第二轮在所有脏模块都已经重新执行过之后进行，重新解析跨模块引用。
//! 两轮只是经验做法，不是拓扑排序，很深的循环依赖仍可能留下旧引用。

use crate::reload::host::ModuleLoader;
use crate::reload::registry::RuntimeRegistry;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 重新导入的轮数
pub const MODULE_RELOAD_PASSES: usize = 2;

/// 把项目相对路径转换为点分模块名
///
/// `screens/home.py` -> `screens.home`；扩展名不在 `extensions` 中时返回 None。
pub fn path_to_module(rel_path: &str, extensions: &[String]) -> Option<String> {
    let (stem, ext) = rel_path.rsplit_once('.')?;
    if ext.contains('/') || !extensions.iter().any(|e| e == ext) {
        return None;
    }
    let name = stem
        .split('/')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(".");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// 一次导入失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub module: String,
    /// 从 1 开始
    pub pass: usize,
    pub error: String,
}

/// 失效与重载结果
#[derive(Debug, Clone, Default)]
pub struct ReloadOutcome {
    /// 被卸载的模块
    pub unloaded: Vec<String>,
    /// 源文件已删除、只卸载不导入的模块
    pub removed: Vec<String>,
    /// 最后一轮导入成功的模块
    pub reloaded: Vec<String>,
    pub failures: Vec<ImportFailure>,
}

impl ReloadOutcome {
    /// 最后一轮仍然失败的导入
    pub fn final_failures(&self) -> impl Iterator<Item = &ImportFailure> {
        self.failures
            .iter()
            .filter(|f| f.pass == MODULE_RELOAD_PASSES)
    }

    pub fn is_clean(&self) -> bool {
        self.final_failures().next().is_none()
    }
}

/// 模块失效器
#[derive(Debug, Clone)]
pub struct ModuleInvalidator {
    root: PathBuf,
    main_module: String,
    extensions: Vec<String>,
}

impl ModuleInvalidator {
    pub fn new(root: impl Into<PathBuf>, main_module: &str, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            main_module: main_module.to_string(),
            extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn module_name(&self, rel_path: &str) -> Option<String> {
        path_to_module(rel_path, &self.extensions)
    }

    /// 卸载变更文件对应的模块并重新导入
    ///
    /// 入口模块不在这里卸载，由进程重启处理。未加载的模块直接忽略。
    /// 单个模块导入失败只记录，不影响同一轮的其他模块。
    pub fn invalidate_and_reload(
        &self,
        changed_paths: &BTreeSet<String>,
        registry: &mut RuntimeRegistry,
        loader: &dyn ModuleLoader,
    ) -> ReloadOutcome {
        let mut outcome = ReloadOutcome::default();
        let mut dirty: Vec<(String, PathBuf)> = Vec::new();

        for rel in changed_paths {
            let Some(name) = self.module_name(rel) else {
                continue;
            };
            if name == self.main_module {
                debug!("入口模块 {} 不参与热重载", name);
                continue;
            }

            let path = self.root.join(rel);
            if registry.unload(&name, &path).is_none() {
                debug!("模块 {} 尚未加载，跳过", name);
                continue;
            }
            outcome.unloaded.push(name.clone());

            if path.is_file() {
                dirty.push((name, path));
            } else {
                info!("模块 {} 的源文件已删除，仅卸载", name);
                outcome.removed.push(name);
            }
        }

        if dirty.is_empty() {
            info!("没有需要重新导入的模块");
            return outcome;
        }

        info!(
            "重新导入 {} 个模块 ({} 轮)",
            dirty.len(),
            MODULE_RELOAD_PASSES
        );

        for pass in 1..=MODULE_RELOAD_PASSES {
            for (name, path) in &dirty {
                registry.factory.unregister_module(name);
                match loader.import(name, path, registry) {
                    Ok(module) => {
                        registry.install(module);
                        if pass == MODULE_RELOAD_PASSES {
                            outcome.reloaded.push(name.clone());
                        }
                    }
                    Err(e) => {
                        warn!("第 {} 轮导入 {} 失败: {:#}", pass, name, e);
                        outcome.failures.push(ImportFailure {
                            module: name.clone(),
                            pass,
                            error: format!("{:#}", e),
                        });
                    }
                }
            }
        }

        outcome
    }

    /// 启动时导入项目中所有尚未加载的模块（入口模块除外），返回成功的数量
    pub fn import_all<'a>(
        &self,
        rel_paths: impl IntoIterator<Item = &'a str>,
        registry: &mut RuntimeRegistry,
        loader: &dyn ModuleLoader,
    ) -> usize {
        let mut imported = 0;
        for rel in rel_paths {
            let Some(name) = self.module_name(rel) else {
                continue;
            };
            if name == self.main_module || registry.modules.contains(&name) {
                continue;
            }
            match loader.import(&name, &self.root.join(rel), registry) {
                Ok(module) => {
                    registry.install(module);
                    imported += 1;
                }
                Err(e) => warn!("导入 {} 失败: {:#}", name, e),
            }
        }
        debug!("已导入 {} 个模块", imported);
        imported
    }
}
