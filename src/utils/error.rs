//! 测试套件错误类型定义
//!
//! 本模块定义了运行时装配、注入与诊断过程中使用的所有错误类型。

use thiserror::Error;

/// 测试套件核心错误类型
#[derive(Error, Debug)]
pub enum HarnessError {
    // ==================== 声明与内容错误 ====================

    /// 模块声明无效（标识为空、版本范围无法解析等）
    #[error("模块声明无效: '{identity}' - {reason}")]
    Declaration {
        identity: String,
        reason: String,
    },

    /// 搜索路径上找不到模块内容
    #[error("模块内容未找到: '{identity}'，已搜索: {searched:?}")]
    ContentNotFound {
        identity: String,
        searched: Vec<String>,
    },

    /// 模块内容中不存在指定条目
    #[error("模块条目未找到: '{entry}' (来源: {origin})")]
    EntryNotFound {
        origin: String,
        entry: String,
    },

    // ==================== 运行时生命周期错误 ====================

    /// 运行时启动失败，已回滚本次创建
    #[error("运行时启动失败: scope '{scope}' - {source}")]
    RuntimeStartFailed {
        scope: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// 运行时创建期间作用域已被释放，新建实例已销毁
    #[error("作用域 '{0}' 在运行时创建期间已释放")]
    ScopeReleased(String),

    /// 嵌入式运行时操作失败
    #[error("运行时操作失败: {operation} - {reason}")]
    Framework {
        operation: String,
        reason: String,
    },

    /// 状态不允许该操作
    #[error("模块 '{module}' 当前状态 {state} 不允许 {operation}")]
    InvalidState {
        module: String,
        state: String,
        operation: String,
    },

    // ==================== 注入错误 ====================

    /// 当前作用域尚未创建运行时
    #[error("作用域 '{0}' 尚未创建运行时")]
    NoRuntimeForScope(String),

    /// 请求的能力不可用
    #[error("能力不可用: '{0}'")]
    CapabilityUnavailable(String),

    /// 参数未声明注入标记或类型不匹配
    #[error("参数 '{parameter}' 不支持注入: {reason}")]
    InjectionUnsupported {
        parameter: String,
        reason: String,
    },

    // ==================== 诊断错误 ====================

    /// 运行时存在错误事件或未满足的组件
    #[error("运行时存在 {} 个错误:\n{}", problems.len(), problems.join("\n"))]
    AssertionFailed {
        problems: Vec<String>,
    },

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 测试套件操作结果类型别名
pub type Result<T> = std::result::Result<T, HarnessError>;

/// 错误码常量
pub mod error_code {
    // 声明错误 (DECLARATION-xxx)
    pub const DECLARATION_INVALID: &str = "DECLARATION-001";

    // 内容错误 (CONTENT-xxx)
    pub const CONTENT_NOT_FOUND: &str = "CONTENT-001";
    pub const CONTENT_ENTRY_NOT_FOUND: &str = "CONTENT-002";

    // 运行时错误 (RUNTIME-xxx)
    pub const RUNTIME_START_FAILED: &str = "RUNTIME-001";
    pub const RUNTIME_OPERATION_FAILED: &str = "RUNTIME-002";
    pub const RUNTIME_INVALID_STATE: &str = "RUNTIME-003";
    pub const RUNTIME_SCOPE_RELEASED: &str = "RUNTIME-004";

    // 注入错误 (INJECTION-xxx)
    pub const INJECTION_NO_RUNTIME: &str = "INJECTION-001";
    pub const INJECTION_CAPABILITY_UNAVAILABLE: &str = "INJECTION-002";
    pub const INJECTION_UNSUPPORTED: &str = "INJECTION-003";

    // 诊断错误 (DIAGNOSTICS-xxx)
    pub const DIAGNOSTICS_ASSERTION_FAILED: &str = "DIAGNOSTICS-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
}

impl HarnessError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            HarnessError::Declaration { .. } => error_code::DECLARATION_INVALID,
            HarnessError::ContentNotFound { .. } => error_code::CONTENT_NOT_FOUND,
            HarnessError::EntryNotFound { .. } => error_code::CONTENT_ENTRY_NOT_FOUND,
            HarnessError::RuntimeStartFailed { .. } => error_code::RUNTIME_START_FAILED,
            HarnessError::Framework { .. } => error_code::RUNTIME_OPERATION_FAILED,
            HarnessError::InvalidState { .. } => error_code::RUNTIME_INVALID_STATE,
            HarnessError::ScopeReleased(_) => error_code::RUNTIME_SCOPE_RELEASED,
            HarnessError::NoRuntimeForScope(_) => error_code::INJECTION_NO_RUNTIME,
            HarnessError::CapabilityUnavailable(_) => {
                error_code::INJECTION_CAPABILITY_UNAVAILABLE
            }
            HarnessError::InjectionUnsupported { .. } => error_code::INJECTION_UNSUPPORTED,
            HarnessError::AssertionFailed { .. } => error_code::DIAGNOSTICS_ASSERTION_FAILED,
            HarnessError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            _ => "UNKNOWN",
        }
    }

    /// 是否为创建阶段（setup）失败
    ///
    /// 诊断断言失败属于普通测试失败，不在此列。
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::RuntimeStartFailed { .. }
                | HarnessError::ContentNotFound { .. }
                | HarnessError::Declaration { .. }
        )
    }

    /// 构造运行时操作错误
    pub fn framework(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        HarnessError::Framework {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = HarnessError::CapabilityUnavailable("my.api.HelloWorld".to_string());
        assert!(err.to_string().contains("my.api.HelloWorld"));
    }

    #[test]
    fn test_error_code() {
        let err = HarnessError::NoRuntimeForScope("scope".to_string());
        assert_eq!(err.error_code(), error_code::INJECTION_NO_RUNTIME);

        let err = HarnessError::ContentNotFound {
            identity: "a".to_string(),
            searched: vec![],
        };
        assert_eq!(err.error_code(), error_code::CONTENT_NOT_FOUND);
    }

    #[test]
    fn test_start_failure_keeps_cause_chain() {
        let cause = HarnessError::ContentNotFound {
            identity: "missing.module".to_string(),
            searched: vec!["/tmp".to_string()],
        };
        let err = HarnessError::RuntimeStartFailed {
            scope: "MyTest".to_string(),
            source: Box::new(cause),
        };

        assert!(err.is_setup_failure());
        let source = err.source().unwrap();
        assert!(source.to_string().contains("missing.module"));
    }

    #[test]
    fn test_assertion_lists_every_problem() {
        let err = HarnessError::AssertionFailed {
            problems: vec!["first".to_string(), "second".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("2 个错误"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert!(!err.is_setup_failure());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarnessError = io_err.into();
        assert!(matches!(err, HarnessError::Io(_)));
    }
}
