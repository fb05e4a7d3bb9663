//! 工具模块
//!
//! 包含错误类型、ID 生成、日志系统等通用工具。

pub mod error;
pub mod id;
pub mod logger;

// 重导出常用类型
pub use error::{error_code, HarnessError, Result};
pub use id::{generate_id, generate_uuid, is_valid_id};
pub use logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
