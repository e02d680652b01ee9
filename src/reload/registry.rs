//! 运行时注册表 - 已加载模块表 + UI 工厂类注册表
//!
//! 两张表只在设备端事件循环上修改，不需要加锁。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 一个已加载的模块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    /// 模块导出的符号（名称 -> 值）
    pub exports: BTreeMap<String, String>,
    /// 模块声明的 UI 工厂类
    pub classes: Vec<String>,
}

impl LoadedModule {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            exports: BTreeMap::new(),
            classes: Vec::new(),
        }
    }

    pub fn export(&self, symbol: &str) -> Option<&str> {
        self.exports.get(symbol).map(String::as_str)
    }
}

/// 模块表接口：测试用内存实现，生产中对接宿主运行时
pub trait ModuleTable: Send {
    fn get(&self, name: &str) -> Option<&LoadedModule>;

    fn put(&mut self, name: &str, module: LoadedModule);

    /// 移除模块；未加载时返回 None
    fn remove(&mut self, name: &str) -> Option<LoadedModule>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn names(&self) -> Vec<String>;
}

/// 内存模块表
#[derive(Debug, Default)]
pub struct MemoryModuleTable {
    modules: BTreeMap<String, LoadedModule>,
}

impl MemoryModuleTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModuleTable for MemoryModuleTable {
    fn get(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.get(name)
    }

    fn put(&mut self, name: &str, module: LoadedModule) {
        self.modules.insert(name.to_string(), module);
    }

    fn remove(&mut self, name: &str) -> Option<LoadedModule> {
        self.modules.remove(name)
    }

    fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

/// 工厂类登记信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryEntry {
    pub module: String,
    pub filename: Option<PathBuf>,
}

/// UI 工厂类注册表：类名 -> 声明它的模块
#[derive(Debug, Default)]
pub struct FactoryRegistry {
    classes: BTreeMap<String, FactoryEntry>,
}

impl FactoryRegistry {
    pub fn register(&mut self, class_name: &str, module: &str, filename: Option<PathBuf>) {
        self.classes.insert(
            class_name.to_string(),
            FactoryEntry {
                module: module.to_string(),
                filename,
            },
        );
    }

    pub fn get(&self, class_name: &str) -> Option<&FactoryEntry> {
        self.classes.get(class_name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// 移除某个模块声明的全部类，返回被移除的类名
    pub fn unregister_module(&mut self, module: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .classes
            .iter()
            .filter(|(_, entry)| entry.module == module)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.classes.remove(name);
        }
        if !removed.is_empty() {
            debug!("已注销模块 {} 的 {} 个工厂类", module, removed.len());
        }
        removed
    }

    /// 移除来自某个文件的全部类
    pub fn unregister_filename(&mut self, filename: &Path) -> Vec<String> {
        let removed: Vec<String> = self
            .classes
            .iter()
            .filter(|(_, entry)| entry.filename.as_deref() == Some(filename))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.classes.remove(name);
        }
        removed
    }
}

/// 运行时注册表，由重载编排器持有并按引用传给失效器
pub struct RuntimeRegistry {
    pub modules: Box<dyn ModuleTable>,
    pub factory: FactoryRegistry,
}

impl RuntimeRegistry {
    pub fn new(modules: Box<dyn ModuleTable>) -> Self {
        Self {
            modules,
            factory: FactoryRegistry::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryModuleTable::new()))
    }

    /// 记录一次成功的导入：写入模块表并登记它声明的类
    pub fn install(&mut self, module: LoadedModule) {
        for class_name in &module.classes {
            self.factory
                .register(class_name, &module.name, Some(module.path.clone()));
        }
        let name = module.name.clone();
        self.modules.put(&name, module);
    }

    /// 卸载模块：先注销工厂类，再从模块表移除
    ///
    /// 模块未加载时什么也不做，返回 None。
    pub fn unload(&mut self, name: &str, filename: &Path) -> Option<LoadedModule> {
        if !self.modules.contains(name) {
            return None;
        }
        self.factory.unregister_filename(filename);
        self.factory.unregister_module(name);
        self.modules.remove(name)
    }
}
