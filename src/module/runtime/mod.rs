//! 嵌入式运行时接口
//!
//! 定义测试套件驱动嵌入式模块运行时所需的控制面。运行时实现由
//! [`FrameworkFactory`] 创建，测试套件只通过 [`Framework`] 访问它。

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::content::ModuleContent;
use super::metadata::{
    CapabilityRegistration, ComponentSnapshot, FrameworkEvent, ModuleId, ModuleSnapshot, ScopeId,
};
use crate::utils::Result;

pub mod memory;

pub use memory::{ComponentFactory, MemoryFramework, MemoryFrameworkFactory};

/// 运行时工厂
#[async_trait]
pub trait FrameworkFactory: Send + Sync {
    /// 以给定属性创建（尚未启动的）运行时
    async fn create(&self, properties: BTreeMap<String, String>) -> Result<Arc<dyn Framework>>;

    /// 工厂名称
    fn name(&self) -> &str;
}

/// 运行时控制面
#[async_trait]
pub trait Framework: Send + Sync {
    /// 启动运行时
    async fn start(&self) -> Result<()>;

    /// 创建隔离作用域
    async fn create_scope(&self, name: &str) -> Result<ScopeId>;

    /// 安装模块到作用域
    async fn install_module(
        &self,
        scope: ScopeId,
        content: Arc<dyn ModuleContent>,
    ) -> Result<ModuleId>;

    /// 启动模块（未解析时先解析）
    async fn start_module(&self, id: ModuleId) -> Result<()>;

    /// 停止模块，未运行的模块直接返回
    async fn stop_module(&self, id: ModuleId) -> Result<()>;

    /// 卸载模块
    async fn uninstall_module(&self, id: ModuleId) -> Result<()>;

    /// 停止运行时
    async fn stop(&self) -> Result<()>;

    /// 已安装模块（按安装顺序）
    async fn modules(&self) -> Vec<ModuleSnapshot>;

    /// 声明式组件
    async fn components(&self) -> Vec<ComponentSnapshot>;

    /// 全部有效的能力注册（按注册顺序）
    async fn capabilities(&self) -> Vec<CapabilityRegistration>;

    /// 从作用域可见的能力注册（按注册顺序）
    async fn capabilities_visible_from(&self, scope: ScopeId) -> Vec<CapabilityRegistration> {
        self.capabilities()
            .await
            .into_iter()
            .filter(|r| scope.can_see(r.scope))
            .collect()
    }

    /// 自创建以来的生命周期事件
    async fn events(&self) -> Vec<FrameworkEvent>;

    /// 运行时属性
    fn property(&self, key: &str) -> Option<String>;
}
