//! 模块运行时装配
//!
//! 包含测试运行时装配的全部组件：
//! - 声明与需求描述（`declaration`、`descriptor`、`resolver`）
//! - 模块内容定位（`content`）
//! - 嵌入式运行时接口与内存实现（`runtime`）
//! - 运行时生命周期、注入、诊断与执行上下文

pub mod content;
pub mod context;
pub mod declaration;
pub mod descriptor;
pub mod diagnostics;
pub mod injection;
pub mod lifecycle;
pub mod metadata;
pub mod resolver;
pub mod runtime;

// 重导出常用类型
pub use content::{
    ArchiveContent, ClasspathContentProvider, ContentEntry, DirectoryContent, ModuleContent,
    ProbeContent,
};
pub use context::{AmbientGuard, AmbientRuntime, ExecutionContext, TestHarness};
pub use declaration::{
    CompositeRegistry, Declaration, PlanFile, ScopeDeclaration, COMPONENT_RUNTIME_COMPOSITE,
    COMPONENT_RUNTIME_MODULE,
};
pub use descriptor::{
    ExportRequirement, InstallationPlan, IsolationGroup, ModuleIdentity, ModuleRequirement,
    PropertyRequirement,
};
pub use diagnostics::{assert_error_free, print_framework_state, tracing_sink};
pub use injection::{
    Injected, InjectionMarker, InjectionResolver, Parameter, PropertyFilter, RUNTIME_HANDLE_TYPE,
};
pub use lifecycle::{InstalledModule, RuntimeInstance, RuntimeLifecycleManager};
pub use metadata::{
    CapabilityRegistration, CapabilityType, ComponentManifest, ComponentSnapshot, ComponentState,
    EventSeverity, FrameworkEvent, ModuleId, ModuleManifest, ModuleSnapshot, ModuleState, ScopeId,
    ServiceObject,
};
pub use resolver::{DescriptorResolver, ResolvedRequirements};
pub use runtime::{Framework, FrameworkFactory, MemoryFramework, MemoryFrameworkFactory};
