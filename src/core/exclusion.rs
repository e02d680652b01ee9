//! 排除规则 - 扫描和打包时跳过的文件
//!
//! 规则按相对路径匹配，因此同一份配置在不同机器上结果一致：
//! - 不含 `/` 的模式匹配路径中的任意一级名称（`__pycache__`、`*.pyc`）
//! - 含 `/` 的模式匹配整个相对路径，`**` 可跨目录；命中目录时其下所有文件一并排除

use regex::Regex;
use tracing::warn;

/// 内部文件，始终排除
pub const BUILTIN_EXCLUSIONS: &[&str] = &[".hotpush", "app_copy.zip"];

/// 推送到设备时的默认排除列表
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "*.pyc",
    "__pycache__",
    ".buildozer",
    ".venv",
    ".vscode",
    ".idea",
    ".git",
    ".pytest_cache",
    ".mypy_cache",
    ".DS_Store",
    ".env",
    "env/",
    "venv/",
    "bin",
    "buildozer.spec",
    "poetry.lock",
    "pyproject.toml",
    "temp",
    "tests",
    ".gitignore",
    "README.md",
    "hotpush.toml",
];

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Regex,
    /// 不含 `/`，按单级名称匹配
    per_component: bool,
}

impl Pattern {
    fn compile(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_end_matches("/**").trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }

        let per_component = !trimmed.contains('/');
        let regex = match Regex::new(&format!("^{}$", glob_to_regex(trimmed))) {
            Ok(re) => re,
            Err(e) => {
                warn!("忽略无效的排除规则 {}: {}", raw, e);
                return None;
            }
        };

        Some(Self {
            raw: raw.to_string(),
            regex,
            per_component,
        })
    }

    fn matches(&self, path: &str) -> bool {
        if self.per_component {
            return path.split('/').any(|name| self.regex.is_match(name));
        }

        if self.regex.is_match(path) {
            return true;
        }

        // 命中某一级父目录
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            end += pos;
            if self.regex.is_match(&path[..end]) {
                return true;
            }
            end += 1;
        }
        false
    }
}

/// 简单的 glob 转正则：`**` 跨目录，`*` 和 `?` 不跨目录
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    let mut buf = [0u8; 4];

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out
}

/// 整个相对路径是否匹配 glob（不按单级名称匹配）
pub fn glob_matches(pattern: &str, rel_path: &str) -> bool {
    let pattern = pattern.trim().trim_start_matches("./");
    if pattern == rel_path {
        return true;
    }
    Regex::new(&format!("^{}$", glob_to_regex(pattern)))
        .map(|re| re.is_match(rel_path))
        .unwrap_or(false)
}

/// 有序的排除规则集合（内置规则 ∪ 用户规则）
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    patterns: Vec<Pattern>,
}

impl ExclusionRules {
    pub fn new<I, S>(user_patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let builtin = BUILTIN_EXCLUSIONS.iter().map(|s| s.to_string());
        let user = user_patterns.into_iter().map(|s| s.as_ref().to_string());

        let mut patterns: Vec<Pattern> = Vec::new();
        for raw in builtin.chain(user) {
            if patterns.iter().any(|p| p.raw == raw) {
                continue;
            }
            if let Some(p) = Pattern::compile(&raw) {
                patterns.push(p);
            }
        }

        Self { patterns }
    }

    /// 检查相对路径（`/` 分隔）是否应该被排除
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        let path = rel_path.trim_start_matches("./").trim_start_matches('/');
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.raw.as_str())
    }
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSIONS)
    }
}
