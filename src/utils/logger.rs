//! 日志系统模块
//!
//! 基于 tracing 生态初始化测试套件的日志输出：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR），支持 `RUST_LOG` 覆盖
//! - 控制台 Pretty / JSON 格式
//! - 可选的文件输出（tracing-appender 非阻塞写入 + 按时间轮转）
//! - 测试友好的初始化（输出交给 libtest 捕获，重复初始化不报错）
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_testkit::utils::logger::{Logger, LoggerConfig};
//!
//! let _guard = Logger::try_init(LoggerConfig::builder().level("debug").build());
//! tracing::info!(scope_key = "my::Test", "装配运行时");
//! ```

use crate::utils::{HarnessError, Result};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转（单个日志文件）
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，无法识别时返回默认值
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（例如 "trace", "debug", "info", "warn", "error"）
    pub level: String,

    /// 是否使用 JSON 格式输出
    pub json_format: bool,

    /// 是否输出到控制台
    pub console_output: bool,

    /// 控制台输出是否交给 libtest 捕获（测试中使用）
    pub test_writer: bool,

    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 日志轮转策略
    pub rotation: RotationStrategy,

    /// 是否显示目标模块
    pub show_target: bool,

    /// 是否显示线程 ID
    pub show_thread_ids: bool,

    /// 自定义过滤指令（EnvFilter 格式）
    /// 例如："chips_testkit=debug,chips_testkit::module::lifecycle=trace"
    pub filter_directives: Option<String>,

    /// 是否启用 ANSI 颜色（控制台输出）
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            test_writer: false,
            file_output: None,
            file_prefix: "chips-testkit".to_string(),
            rotation: RotationStrategy::Daily,
            show_target: true,
            show_thread_ids: false,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::new()
    }

    /// 测试默认配置：debug 级别，输出交给 libtest 捕获
    pub fn for_tests() -> Self {
        Self::builder()
            .level("debug")
            .test_writer(true)
            .ansi_colors(false)
            .build()
    }

    /// 从 HarnessConfig 的 LogConfig 创建
    pub fn from_log_config(log_config: &crate::core::config::LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            ..Default::default()
        }
    }

    /// 解析日志级别字符串
    fn parse_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: LoggerConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用 JSON 格式输出
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 设置控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 控制台输出交给 libtest 捕获
    pub fn test_writer(mut self, enable: bool) -> Self {
        self.config.test_writer = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置日志文件前缀
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 显示目标模块
    pub fn show_target(mut self, enable: bool) -> Self {
        self.config.show_target = enable;
        self
    }

    /// 显示线程 ID
    pub fn show_thread_ids(mut self, enable: bool) -> Self {
        self.config.show_thread_ids = enable;
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 启用 ANSI 颜色
    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有文件写入器的 WorkerGuard，丢弃时等待挂起的日志写入完成。
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn empty() -> Self {
        Self { _file_guard: None }
    }

    /// 是否持有文件写入守卫
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

// ============================================================================
// 日志系统
// ============================================================================

/// 全局日志初始化状态
static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// # Errors
    ///
    /// 日志系统已初始化时返回 `InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(HarnessError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guard = LogGuard::empty();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            layers.push(Self::console_layer(&config));
        }

        if let Some(ref log_dir) = config.file_output {
            let file_appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                log_dir,
                format!("{}.log", config.file_prefix),
            );
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard._file_guard = Some(file_guard);

            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_ansi(false);
            layers.push(if config.json_format {
                layer.json().boxed()
            } else {
                layer.boxed()
            });
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init()
            .map_err(|e| HarnessError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(true);
        Ok(guard)
    }

    /// 尝试初始化日志系统（不会失败）
    ///
    /// 已初始化时返回空守卫，适用于多个测试重复调用。
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_else(|_| LogGuard::empty())
    }

    /// 控制台层
    fn console_layer(config: &LoggerConfig) -> BoxedLayer {
        let layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids);

        match (config.json_format, config.test_writer) {
            (true, true) => layer.json().with_test_writer().boxed(),
            (true, false) => layer.json().with_writer(io::stdout).boxed(),
            (false, true) => layer
                .with_ansi(config.ansi_colors)
                .with_test_writer()
                .boxed(),
            (false, false) => layer
                .with_ansi(config.ansi_colors)
                .with_writer(io::stdout)
                .boxed(),
        }
    }

    /// 创建 EnvFilter，优先使用环境变量 RUST_LOG
    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.parse_level().as_str().to_lowercase()));

        match config.filter_directives {
            Some(ref directives) => directives
                .split(',')
                .filter_map(|d| d.trim().parse().ok())
                .fold(filter, |f, directive| f.add_directive(directive)),
            None => filter,
        }
    }
}
