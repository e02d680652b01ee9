//! 项目配置 - `hotpush.toml`

use crate::core::exclusion::{ExclusionRules, DEFAULT_EXCLUSIONS};
use crate::error::{HotpushError, Result};
use crate::logging::LogConfig;
use crate::reload::orchestrator::{ReloadRules, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// 配置文件名
pub const CONFIG_FILE: &str = "hotpush.toml";

/// 热重载配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloaderConfig {
    /// 单独监听的文件
    #[serde(default)]
    pub watched_files: Vec<String>,
    /// 只监听第一层的目录
    #[serde(default)]
    pub watched_folders: Vec<String>,
    /// 递归监听的目录
    #[serde(default = "default_watched_folders_recursively")]
    pub watched_folders_recursively: Vec<String>,
    /// 不触发重载的文件
    #[serde(default = "default_do_not_watch_patterns")]
    pub do_not_watch_patterns: Vec<String>,
    /// 修改后需要重启进程的文件
    #[serde(default = "default_full_reload_files")]
    pub full_reload_files: Vec<String>,
    /// 后台服务名称，与 `service_files` 按位置对应
    #[serde(default)]
    pub service_names: Vec<String>,
    #[serde(default)]
    pub service_files: Vec<String>,
    /// 是否同时推送到设备
    #[serde(default)]
    pub hot_reload_on_phone: bool,
    #[serde(default)]
    pub phone_ips: Vec<String>,
    #[serde(default = "default_reloader_port")]
    pub reloader_port: u16,
    /// 推送时排除的文件
    #[serde(default = "default_exclude_from_phone")]
    pub exclude_from_phone: Vec<String>,
    /// 防抖间隔（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_module_extensions")]
    pub module_extensions: Vec<String>,
    #[serde(default = "default_markup_extensions")]
    pub markup_extensions: Vec<String>,
    /// 入口模块名，不参与热重载
    #[serde(default = "default_main_module")]
    pub main_module: String,
    /// 桌面端应用启动命令；为空时重启 hotpush 自身
    #[serde(default)]
    pub app_command: Vec<String>,
    /// 重新编译服务文件的命令，文件路径追加在最后
    #[serde(default = "default_service_compile_command")]
    pub service_compile_command: Vec<String>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_watched_folders_recursively() -> Vec<String> {
    vec![".".to_string()]
}

fn default_do_not_watch_patterns() -> Vec<String> {
    vec!["*.pyc".to_string(), "*__pycache__*".to_string()]
}

fn default_full_reload_files() -> Vec<String> {
    vec!["main.py".to_string()]
}

fn default_reloader_port() -> u16 {
    8050
}

fn default_exclude_from_phone() -> Vec<String> {
    DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect()
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_ack_timeout_secs() -> u64 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    1
}

fn default_module_extensions() -> Vec<String> {
    vec!["py".to_string()]
}

fn default_markup_extensions() -> Vec<String> {
    vec!["kv".to_string()]
}

fn default_main_module() -> String {
    "main".to_string()
}

fn default_service_compile_command() -> Vec<String> {
    vec!["python".to_string(), "-m".to_string(), "compileall".to_string()]
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            watched_files: Vec::new(),
            watched_folders: Vec::new(),
            watched_folders_recursively: default_watched_folders_recursively(),
            do_not_watch_patterns: default_do_not_watch_patterns(),
            full_reload_files: default_full_reload_files(),
            service_names: Vec::new(),
            service_files: Vec::new(),
            hot_reload_on_phone: false,
            phone_ips: Vec::new(),
            reloader_port: default_reloader_port(),
            exclude_from_phone: default_exclude_from_phone(),
            debounce_ms: default_debounce_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            module_extensions: default_module_extensions(),
            markup_extensions: default_markup_extensions(),
            main_module: default_main_module(),
            app_command: Vec::new(),
            service_compile_command: default_service_compile_command(),
            log: LogConfig::default(),
        }
    }
}

impl ReloaderConfig {
    /// 从项目根目录加载配置
    ///
    /// 文件不存在或无法解析都是配置错误；个别非法取值替换为默认值并警告。
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HotpushError::Config(format!(
                    "找不到 {}，请先运行 `hotpush init`",
                    path.display()
                )));
            }
            Err(e) => return Err(HotpushError::io(path, e)),
        };

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| HotpushError::Config(format!("{}: {}", path.display(), e)))?;
        config.sanitize();
        Ok(config)
    }

    /// 写回配置文件
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)
            .map_err(|e| HotpushError::Config(format!("序列化配置失败: {}", e)))?;
        fs::write(&path, content).map_err(|e| HotpushError::io(path, e))
    }

    fn sanitize(&mut self) {
        if self.reloader_port == 0 {
            warn!("reloader_port 不能为 0，使用默认端口 {}", default_reloader_port());
            self.reloader_port = default_reloader_port();
        }
        if self.debounce_ms == 0 {
            warn!("debounce_ms 不能为 0，使用默认值 {}", default_debounce_ms());
            self.debounce_ms = default_debounce_ms();
        }
        if self.ack_timeout_secs == 0 {
            self.ack_timeout_secs = default_ack_timeout_secs();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        if self.service_names.len() != self.service_files.len() {
            warn!(
                "service_names ({}) 与 service_files ({}) 数量不一致，多余的项将被忽略",
                self.service_names.len(),
                self.service_files.len()
            );
        }
    }

    /// 启动前检查：至少要有一个监听目标
    pub fn validate(&self) -> Result<()> {
        if self.watched_files.is_empty()
            && self.watched_folders.is_empty()
            && self.watched_folders_recursively.is_empty()
        {
            return Err(HotpushError::Config(
                "没有配置任何监听目标 (watched_files / watched_folders / watched_folders_recursively)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// 推送到设备时使用的排除规则
    pub fn exclusion_rules(&self) -> ExclusionRules {
        ExclusionRules::new(&self.exclude_from_phone)
    }

    /// 监听时忽略的文件
    pub fn watch_filter(&self) -> ExclusionRules {
        ExclusionRules::new(&self.do_not_watch_patterns)
    }

    pub fn services(&self) -> Vec<ServiceSpec> {
        self.service_names
            .iter()
            .zip(&self.service_files)
            .map(|(name, file)| ServiceSpec {
                name: name.clone(),
                file: file.clone(),
            })
            .collect()
    }

    pub fn reload_rules(&self) -> ReloadRules {
        ReloadRules {
            full_reload_files: self.full_reload_files.clone(),
            services: self.services(),
            module_extensions: self.module_extensions.clone(),
            markup_extensions: self.markup_extensions.clone(),
            main_module: self.main_module.clone(),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
