//! 运行时生命周期管理器
//!
//! 按作用域键创建、缓存并销毁嵌入式运行时实例。
//!
//! 创建顺序：
//! 1. 折叠属性（配置默认值在下，声明覆盖其上）
//! 2. 由工厂创建运行时并启动
//! 3. 安装并启动测试探针模块（携带导出包）
//! 4. 默认组：全部安装，然后按顺序启动标记为启动的模块
//! 5. 每个隔离组：创建独立作用域，再按同样方式安装、启动
//!
//! 任何一步失败都会回滚本次创建已完成的部分，并返回 `RuntimeStartFailed`。
//! 失败不缓存，下一个调用者会重新创建。

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, instrument, warn};

use super::content::{ClasspathContentProvider, ProbeContent};
use super::descriptor::ModuleRequirement;
use super::metadata::{CapabilityRegistration, ModuleId, ScopeId};
use super::resolver::ResolvedRequirements;
use super::runtime::{Framework, FrameworkFactory};
use crate::core::HarnessConfig;
use crate::utils::{generate_id, HarnessError, Result};

/// 运行时中已安装的模块记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledModule {
    /// 运行时分配的模块句柄
    pub id: ModuleId,
    /// 声明中的标识
    pub identity: String,
    /// 所在作用域
    pub scope: ScopeId,
    /// 所在隔离组
    pub group: Option<String>,
    /// 是否由测试套件启动
    pub started: bool,
}

/// 运行时实例
///
/// 一个作用域键拥有一个实例；实例在作用域结束时销毁。
pub struct RuntimeInstance {
    id: String,
    scope_key: String,
    framework: Arc<dyn Framework>,
    properties: BTreeMap<String, String>,
    installed: Vec<InstalledModule>,
    groups: BTreeMap<String, ScopeId>,
    created_at: DateTime<Utc>,
    released: AtomicBool,
}

impl RuntimeInstance {
    /// 实例 ID（10 位 62 进制），同一作用域键的先后实例 ID 不同
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 作用域键
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    /// 运行时控制面
    pub fn framework(&self) -> &Arc<dyn Framework> {
        &self.framework
    }

    /// 创建时生效的属性
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// 运行时属性
    pub fn property(&self, key: &str) -> Option<String> {
        self.framework.property(key)
    }

    /// 已安装模块（安装顺序，测试探针在最前）
    pub fn installed(&self) -> &[InstalledModule] {
        &self.installed
    }

    /// 测试探针模块
    pub fn probe(&self) -> Option<&InstalledModule> {
        self.installed.first()
    }

    /// 隔离组对应的作用域
    pub fn group_scope(&self, group: &str) -> Option<ScopeId> {
        self.groups.get(group).copied()
    }

    /// 全部隔离组
    pub fn groups(&self) -> &BTreeMap<String, ScopeId> {
        &self.groups
    }

    /// 创建时间
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 是否已释放
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// 从默认组（测试代码所在位置）可见的能力
    pub async fn visible_capabilities(&self) -> Vec<CapabilityRegistration> {
        self.framework
            .capabilities_visible_from(ScopeId::DEFAULT)
            .await
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(scope = %self.scope_key, instance_id = %self.id, "销毁运行时实例");
        teardown(&self.scope_key, self.framework.as_ref(), &self.installed).await;
    }
}

impl fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("id", &self.id)
            .field("scope_key", &self.scope_key)
            .field("properties", &self.properties)
            .field("installed", &self.installed)
            .field("groups", &self.groups)
            .field("created_at", &self.created_at)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 停止已启动的模块（逆序）、卸载全部模块（逆序）、停止运行时
///
/// 尽力而为：单步失败只记录日志，不中断后续步骤。
async fn teardown(scope_key: &str, framework: &dyn Framework, installed: &[InstalledModule]) {
    for module in installed.iter().rev().filter(|m| m.started) {
        if let Err(e) = framework.stop_module(module.id).await {
            warn!(scope = %scope_key, module_id = %module.id, error = %e, "停止模块失败");
        }
    }
    for module in installed.iter().rev() {
        if let Err(e) = framework.uninstall_module(module.id).await {
            warn!(scope = %scope_key, module_id = %module.id, error = %e, "卸载模块失败");
        }
    }
    if let Err(e) = framework.stop().await {
        warn!(scope = %scope_key, error = %e, "停止运行时失败");
    }
    debug!(scope = %scope_key, modules = installed.len(), "运行时已销毁");
}

type InstanceCell = Arc<OnceCell<Arc<RuntimeInstance>>>;

/// 运行时生命周期管理器
pub struct RuntimeLifecycleManager {
    factory: Arc<dyn FrameworkFactory>,
    content: ClasspathContentProvider,
    probe_name: String,
    default_properties: BTreeMap<String, String>,
    /// 作用域键 -> 实例（单次创建）
    instances: Mutex<HashMap<String, InstanceCell>>,
}

impl RuntimeLifecycleManager {
    /// 创建生命周期管理器
    pub fn new(
        factory: Arc<dyn FrameworkFactory>,
        content: ClasspathContentProvider,
        config: &HarnessConfig,
    ) -> Self {
        info!(
            factory = factory.name(),
            search_path = ?content.roots(),
            "创建运行时生命周期管理器"
        );
        Self {
            factory,
            content,
            probe_name: config.probe_name.clone(),
            default_properties: config.default_properties.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（必要时创建）作用域的运行时实例
    ///
    /// 同一作用域键的并发调用只会创建一次，所有调用者得到同一个实例。
    /// 创建失败时不缓存，之后的调用会重新尝试。
    ///
    /// # Errors
    ///
    /// 创建期间作用域被 [`release`](Self::release) 时，新建实例会立即销毁并返回 `ScopeReleased`
    pub async fn acquire(
        &self,
        scope_key: &str,
        requirements: &ResolvedRequirements,
    ) -> Result<Arc<RuntimeInstance>> {
        let cell = {
            let mut instances = self.instances.lock().await;
            instances
                .entry(scope_key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let created = cell
            .get_or_try_init(|| self.create(scope_key, requirements))
            .await
            .cloned();

        let mut instances = self.instances.lock().await;
        let registered = instances
            .get(scope_key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));

        match created {
            Ok(instance) if registered => Ok(instance),
            Ok(instance) => {
                drop(instances);
                warn!(scope = %scope_key, "运行时创建期间作用域已释放，销毁新建实例");
                instance.release().await;
                Err(HarnessError::ScopeReleased(scope_key.to_string()))
            }
            Err(e) => {
                // 映射表与本调用之外无人持有时移除空单元
                if registered && !cell.initialized() && Arc::strong_count(&cell) == 2 {
                    instances.remove(scope_key);
                }
                Err(e)
            }
        }
    }

    /// 查找已创建的实例
    pub async fn get(&self, scope_key: &str) -> Option<Arc<RuntimeInstance>> {
        let instances = self.instances.lock().await;
        instances
            .get(scope_key)
            .and_then(|cell| cell.get().cloned())
    }

    /// 已创建实例的作用域键（排序后）
    pub async fn active_scopes(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut keys: Vec<String> = instances
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// 销毁作用域的运行时，重复调用无副作用
    #[instrument(skip(self))]
    pub async fn release(&self, scope_key: &str) {
        let cell = self.instances.lock().await.remove(scope_key);
        if let Some(instance) = cell.and_then(|c| c.get().cloned()) {
            instance.release().await;
            info!(scope = %scope_key, "运行时已释放");
        }
    }

    /// 销毁全部运行时
    pub async fn release_all(&self) {
        let instances: Vec<Arc<RuntimeInstance>> = self
            .instances
            .lock()
            .await
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        let count = instances.len();
        join_all(instances.iter().map(|instance| instance.release())).await;
        info!(count, "全部运行时已释放");
    }

    #[instrument(skip(self, requirements), fields(scope = %scope_key))]
    async fn create(
        &self,
        scope_key: &str,
        requirements: &ResolvedRequirements,
    ) -> Result<Arc<RuntimeInstance>> {
        for problem in &requirements.problems {
            warn!(scope = %scope_key, "{}", problem);
        }

        let properties = requirements.effective_properties(&self.default_properties);
        let framework = self
            .factory
            .create(properties.clone())
            .await
            .map_err(|e| start_failed(scope_key, e))?;

        let mut installed = Vec::new();
        let mut groups = BTreeMap::new();
        if let Err(e) = self
            .provision(framework.as_ref(), requirements, &mut installed, &mut groups)
            .await
        {
            error!(scope = %scope_key, error = %e, "运行时创建失败，回滚");
            teardown(scope_key, framework.as_ref(), &installed).await;
            return Err(start_failed(scope_key, e));
        }

        let id = generate_id();
        info!(
            scope = %scope_key,
            instance_id = %id,
            modules = installed.len(),
            groups = groups.len(),
            "运行时已创建"
        );
        Ok(Arc::new(RuntimeInstance {
            id,
            scope_key: scope_key.to_string(),
            framework,
            properties,
            installed,
            groups,
            created_at: Utc::now(),
            released: AtomicBool::new(false),
        }))
    }

    async fn provision(
        &self,
        framework: &dyn Framework,
        requirements: &ResolvedRequirements,
        installed: &mut Vec<InstalledModule>,
        groups: &mut BTreeMap<String, ScopeId>,
    ) -> Result<()> {
        framework.start().await?;

        let probe = ProbeContent::with_exports(&self.probe_name, requirements.export_specs())?;
        let probe_id = framework
            .install_module(ScopeId::DEFAULT, Arc::new(probe))
            .await?;
        installed.push(InstalledModule {
            id: probe_id,
            identity: self.probe_name.clone(),
            scope: ScopeId::DEFAULT,
            group: None,
            started: false,
        });
        framework.start_module(probe_id).await?;
        if let Some(probe) = installed.last_mut() {
            probe.started = true;
        }

        self.install_group(
            framework,
            ScopeId::DEFAULT,
            None,
            &requirements.plan.default_group,
            installed,
        )
        .await?;

        for group in &requirements.plan.isolation_groups {
            let scope = framework.create_scope(&group.name).await?;
            groups.insert(group.name.clone(), scope);
            self.install_group(framework, scope, Some(group.name.as_str()), &group.modules, installed)
                .await?;
        }
        Ok(())
    }

    async fn install_group(
        &self,
        framework: &dyn Framework,
        scope: ScopeId,
        group: Option<&str>,
        modules: &[ModuleRequirement],
        installed: &mut Vec<InstalledModule>,
    ) -> Result<()> {
        let first = installed.len();
        for requirement in modules {
            let identity = requirement.parse_identity()?;
            let content = self.content.locate(&identity)?;
            let id = framework.install_module(scope, content).await?;
            debug!(module_id = %id, identity = %requirement.identity, group = ?group, "模块已安装");
            installed.push(InstalledModule {
                id,
                identity: requirement.identity.clone(),
                scope,
                group: group.map(str::to_string),
                started: false,
            });
        }

        for (offset, requirement) in modules.iter().enumerate() {
            if !requirement.start {
                continue;
            }
            let index = first + offset;
            let id = installed[index].id;
            // 先标记，启动失败时回滚也会尝试停止
            installed[index].started = true;
            framework.start_module(id).await?;
            debug!(module_id = %id, identity = %requirement.identity, "模块已启动");
        }
        Ok(())
    }
}

impl fmt::Debug for RuntimeLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLifecycleManager")
            .field("factory", &self.factory.name())
            .field("content", &self.content)
            .field("probe_name", &self.probe_name)
            .finish()
    }
}

fn start_failed(scope_key: &str, source: HarnessError) -> HarnessError {
    HarnessError::RuntimeStartFailed {
        scope: scope_key.to_string(),
        source: Box::new(source),
    }
}
