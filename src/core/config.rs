//! 测试套件配置
//!
//! 定义运行时装配所需的配置结构和加载逻辑。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::{HarnessError, Result};

/// 搜索路径环境变量（按平台路径分隔符分隔）
pub const SEARCH_PATH_ENV: &str = "CHIPS_TESTKIT_PATH";

/// 默认的测试探针模块名
pub const DEFAULT_PROBE_NAME: &str = "chips.test.probe";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 测试套件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 模块搜索路径（目录或 .tar 归档），按顺序查找
    #[serde(default)]
    pub search_path: Vec<PathBuf>,

    /// 是否追加环境变量 `CHIPS_TESTKIT_PATH` 中的搜索路径
    #[serde(default = "default_true")]
    pub use_env_search_path: bool,

    /// 测试探针模块名
    #[serde(default = "default_probe_name")]
    pub probe_name: String,

    /// 所有运行时共享的默认属性，会被声明中的属性覆盖
    #[serde(default)]
    pub default_properties: BTreeMap<String, String>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_true() -> bool {
    true
}

fn default_probe_name() -> String {
    DEFAULT_PROBE_NAME.to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            search_path: vec![],
            use_env_search_path: true,
            probe_name: default_probe_name(),
            default_properties: BTreeMap::new(),
            logging: LogConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// 创建配置构建器
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::new()
    }

    /// 从文件加载配置（.json 按 JSON 解析，其余按 YAML 解析）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            HarnessError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config: HarnessConfig = if is_json(&path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: HarnessConfig) {
        for dir in other.search_path {
            if !self.search_path.contains(&dir) {
                self.search_path.push(dir);
            }
        }
        if !other.use_env_search_path {
            self.use_env_search_path = false;
        }
        if other.probe_name != DEFAULT_PROBE_NAME {
            self.probe_name = other.probe_name;
        }
        self.default_properties.extend(other.default_properties);
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
    }

    /// 实际生效的搜索路径：配置项在前，环境变量在后
    pub fn effective_search_path(&self) -> Vec<PathBuf> {
        let mut roots = self.search_path.clone();
        if self.use_env_search_path {
            if let Some(value) = std::env::var_os(SEARCH_PATH_ENV) {
                for root in std::env::split_paths(&value) {
                    if !root.as_os_str().is_empty() && !roots.contains(&root) {
                        roots.push(root);
                    }
                }
            }
        }
        roots
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: HarnessConfig::default(),
        }
    }

    /// 追加搜索路径
    pub fn search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.search_path.push(root.into());
        self
    }

    /// 不读取环境变量中的搜索路径
    pub fn ignore_env_search_path(mut self) -> Self {
        self.config.use_env_search_path = false;
        self
    }

    /// 设置测试探针模块名
    pub fn probe_name(mut self, name: impl Into<String>) -> Self {
        self.config.probe_name = name.into();
        self
    }

    /// 设置默认运行时属性
    pub fn default_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_properties
            .insert(key.into(), value.into());
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 构建配置
    pub fn build(self) -> HarnessConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert!(config.search_path.is_empty());
        assert!(config.use_env_search_path);
        assert_eq!(config.probe_name, DEFAULT_PROBE_NAME);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_builder() {
        let config = HarnessConfig::builder()
            .search_root("/modules")
            .ignore_env_search_path()
            .default_property("level", "3")
            .log_level("debug")
            .build();

        assert_eq!(config.search_path, vec![PathBuf::from("/modules")]);
        assert_eq!(config.effective_search_path(), vec![PathBuf::from("/modules")]);
        assert_eq!(config.default_properties.get("level").map(String::as_str), Some("3"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_config_merge() {
        let mut base = HarnessConfig::builder().search_root("/a").build();
        let other = HarnessConfig::builder()
            .search_root("/a")
            .search_root("/b")
            .probe_name("my.probe")
            .log_level("trace")
            .build();

        base.merge(other);

        assert_eq!(base.search_path, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(base.probe_name, "my.probe");
        assert_eq!(base.logging.level, "trace");
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let yaml = r#"
search_path:
  - /opt/modules
  - /opt/bundles.tar
default_properties:
  level: "5"
logging:
  level: warn
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.search_path.len(), 2);
        assert_eq!(config.probe_name, DEFAULT_PROBE_NAME);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.default_properties["level"], "5");
    }
}
