//! # Chips Testkit - 模块化运行时测试套件
//!
//! 为测试装配一个隔离的、进程内的模块化运行时：
//!
//! - **声明式需求**: 在测试实体上声明模块、运行时属性和导出包，嵌套实体继承外层声明
//! - **内容定位**: 直接从搜索路径（目录或 .tar 归档）读取模块内容，无需打包
//! - **生命周期管理**: 每个作用域一个运行时，按需创建、缓存，作用域结束时销毁
//! - **隔离组**: 隔离组中的模块能看到默认组，默认组看不到隔离组
//! - **注入**: 向测试体注入运行时实例或已注册的能力
//! - **诊断**: 输出模块、组件、能力拓扑，并断言运行时无错误
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_testkit::{HarnessConfig, ModuleRequirement, ScopeDeclaration, TestHarness};
//!
//! #[tokio::main]
//! async fn main() -> chips_testkit::Result<()> {
//!     let harness = TestHarness::new(HarnessConfig::builder().search_root("target/modules").build());
//!     let scope = ScopeDeclaration::new("my::ImplTest")
//!         .with_module(ModuleRequirement::new("api-module"))
//!         .with_module(ModuleRequirement::new("impl-module").started().isolated())
//!         .with_property("level", "5");
//!
//!     harness
//!         .run(&scope, |ctx| async move {
//!             let greeting: std::sync::Arc<String> = ctx.capability("my.api.Greeter").await?;
//!             println!("{}", greeting);
//!             ctx.assert_error_free().await
//!         })
//!         .await?;
//!
//!     harness.after_all(&scope).await;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 声明、解析、内容、运行时、生命周期、注入与诊断
//! - `core` - 测试套件配置
//! - `utils` - 错误类型、日志与标识生成

#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    AmbientRuntime, CapabilityRegistration, ClasspathContentProvider, CompositeRegistry,
    ComponentState, Declaration, DescriptorResolver, ExecutionContext, Framework,
    FrameworkFactory, InjectionMarker, InjectionResolver, MemoryFrameworkFactory, ModuleContent,
    ModuleIdentity, ModuleRequirement, ModuleState, Parameter, PlanFile, PropertyFilter, ResolvedRequirements,
    RuntimeInstance, RuntimeLifecycleManager, ScopeDeclaration, TestHarness,
    COMPONENT_RUNTIME_COMPOSITE, RUNTIME_HANDLE_TYPE,
};

pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_id, generate_uuid, is_valid_id, HarnessError, Result};

pub use core::config::{HarnessConfig, HarnessConfigBuilder, LogConfig, SEARCH_PATH_ENV};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
