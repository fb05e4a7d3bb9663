//! 核心模块
//!
//! 包含测试套件配置。

pub mod config;

pub use config::{HarnessConfig, HarnessConfigBuilder, LogConfig, SEARCH_PATH_ENV};
