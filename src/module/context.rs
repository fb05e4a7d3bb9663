//! 执行上下文
//!
//! 测试体通过显式传入的 [`ExecutionContext`] 访问运行时。对于无法传参的代码，
//! 还提供环境绑定：
//! - [`AmbientRuntime::bind`]：绑定到当前线程，返回的守卫在析构时（包括 panic 展开）恢复原绑定
//! - [`AmbientRuntime::scope_async`]：绑定到当前 tokio 任务
//!
//! [`AmbientRuntime::current`] 先查任务绑定，再查线程绑定。
//!
//! [`TestHarness`] 把配置、需求解析、生命周期管理与注入组合为测试容器的三个钩子：
//! `before_all`、`run`、`after_all`。

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

use super::declaration::{CompositeRegistry, ScopeDeclaration};
use super::diagnostics;
use super::injection::{lookup_capability, Injected, InjectionResolver, Parameter, PropertyFilter};
use super::lifecycle::{RuntimeInstance, RuntimeLifecycleManager};
use super::content::ClasspathContentProvider;
use super::metadata::{CapabilityRegistration, CapabilityType};
use super::resolver::{DescriptorResolver, ResolvedRequirements};
use super::runtime::{Framework, FrameworkFactory, MemoryFrameworkFactory};
use crate::core::HarnessConfig;
use crate::utils::{HarnessError, Result};

thread_local! {
    static THREAD_BINDING: RefCell<Option<Arc<RuntimeInstance>>> = const { RefCell::new(None) };
}

tokio::task_local! {
    static TASK_BINDING: Arc<RuntimeInstance>;
}

/// 环境运行时绑定
pub struct AmbientRuntime;

impl AmbientRuntime {
    /// 绑定到当前线程
    pub fn bind(instance: Arc<RuntimeInstance>) -> AmbientGuard {
        let previous = THREAD_BINDING.with(|binding| binding.borrow_mut().replace(instance));
        AmbientGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// 在绑定了运行时的任务上下文中执行 future
    pub async fn scope_async<F: Future>(instance: Arc<RuntimeInstance>, future: F) -> F::Output {
        TASK_BINDING.scope(instance, future).await
    }

    /// 当前绑定的运行时
    pub fn current() -> Option<Arc<RuntimeInstance>> {
        TASK_BINDING
            .try_with(Arc::clone)
            .ok()
            .or_else(|| THREAD_BINDING.with(|binding| binding.borrow().clone()))
    }
}

/// 线程绑定守卫，析构时恢复之前的绑定
#[must_use = "守卫析构时立即解除绑定"]
pub struct AmbientGuard {
    previous: Option<Arc<RuntimeInstance>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_BINDING.with(|binding| *binding.borrow_mut() = previous);
    }
}

/// 测试体的执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    scope_key: String,
    runtime: Arc<RuntimeInstance>,
    injection: InjectionResolver,
}

impl ExecutionContext {
    pub fn new(runtime: Arc<RuntimeInstance>, injection: InjectionResolver) -> Self {
        Self {
            scope_key: runtime.scope_key().to_string(),
            runtime,
            injection,
        }
    }

    /// 作用域键
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    /// 运行时实例
    pub fn runtime(&self) -> &Arc<RuntimeInstance> {
        &self.runtime
    }

    /// 运行时控制面
    pub fn framework(&self) -> &dyn Framework {
        self.runtime.framework().as_ref()
    }

    /// 把运行时绑定到当前线程
    pub fn enter(&self) -> AmbientGuard {
        AmbientRuntime::bind(self.runtime.clone())
    }

    /// 解析注入参数
    pub async fn resolve(&self, parameter: &Parameter) -> Result<Injected> {
        self.injection.resolve(parameter, &self.scope_key).await
    }

    /// 查找能力注册
    pub async fn lookup(
        &self,
        capability: &str,
        filter: Option<&PropertyFilter>,
    ) -> Result<CapabilityRegistration> {
        lookup_capability(&self.runtime, &CapabilityType::new(capability), filter).await
    }

    /// 按类型取出能力的服务对象
    pub async fn capability<T: Any + Send + Sync>(&self, capability: &str) -> Result<Arc<T>> {
        self.injection.capability::<T>(&self.scope_key, capability).await
    }

    /// 输出运行时完整状态
    pub async fn print_framework_state(&self, sink: &mut dyn FnMut(String)) {
        diagnostics::print_framework_state(self.framework(), sink).await;
    }

    /// 检查运行时无错误
    pub async fn assert_error_free(&self) -> Result<()> {
        diagnostics::assert_error_free(self.framework()).await
    }
}

/// 测试容器
pub struct TestHarness {
    config: HarnessConfig,
    resolver: DescriptorResolver,
    lifecycle: Arc<RuntimeLifecycleManager>,
    injection: InjectionResolver,
}

impl TestHarness {
    /// 使用内存运行时创建
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_factory(config, Arc::new(MemoryFrameworkFactory::new()))
    }

    /// 使用指定的运行时工厂创建
    pub fn with_factory(config: HarnessConfig, factory: Arc<dyn FrameworkFactory>) -> Self {
        let content = ClasspathContentProvider::from_config(&config);
        let lifecycle = Arc::new(RuntimeLifecycleManager::new(factory, content, &config));
        info!(
            probe = %config.probe_name,
            "测试容器已创建"
        );
        Self {
            injection: InjectionResolver::new(lifecycle.clone()),
            resolver: DescriptorResolver::new(),
            lifecycle,
            config,
        }
    }

    /// 追加自定义组合声明
    pub fn with_composites(mut self, composites: CompositeRegistry) -> Self {
        let mut registry = self.resolver.composites().clone();
        registry.extend(composites);
        self.resolver = DescriptorResolver::with_composites(registry);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<RuntimeLifecycleManager> {
        &self.lifecycle
    }

    pub fn injection(&self) -> &InjectionResolver {
        &self.injection
    }

    /// 解析测试实体的声明
    pub fn resolve(&self, scope: &ScopeDeclaration) -> ResolvedRequirements {
        self.resolver.resolve(scope)
    }

    /// 测试实体开始：创建（或复用）运行时
    pub async fn before_all(&self, scope: &ScopeDeclaration) -> Result<Arc<RuntimeInstance>> {
        let requirements = self.resolve(scope);
        self.lifecycle.acquire(&scope.name, &requirements).await
    }

    /// 在运行时上下文中执行测试体
    ///
    /// 测试体执行期间运行时绑定到当前任务。
    pub async fn run<F, Fut, T>(&self, scope: &ScopeDeclaration, body: F) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let runtime = self.before_all(scope).await?;
        let context = ExecutionContext::new(runtime.clone(), self.injection.clone());
        debug!(scope = %scope.name, "执行测试体");
        AmbientRuntime::scope_async(runtime, body(context)).await
    }

    /// 已创建运行时的执行上下文
    pub async fn context(&self, scope_key: &str) -> Result<ExecutionContext> {
        let runtime = self
            .lifecycle
            .get(scope_key)
            .await
            .ok_or_else(|| HarnessError::NoRuntimeForScope(scope_key.to_string()))?;
        Ok(ExecutionContext::new(runtime, self.injection.clone()))
    }

    /// 测试实体结束：销毁运行时
    pub async fn after_all(&self, scope: &ScopeDeclaration) {
        self.lifecycle.release(&scope.name).await;
    }

    /// 销毁全部运行时
    pub async fn shutdown(&self) {
        self.lifecycle.release_all().await;
    }
}
