//! 内存运行时
//!
//! [`Framework`] 的参考实现。模块行为完全由清单描述：
//! - 启动时按可见的导出包解析 `imports`
//! - 启动后注册 `capabilities`，并登记声明式组件
//! - 组件的引用全部可见（且配置就绪）时激活，注册其 `provides`，直到不再变化
//!
//! 所有状态转换都记录为事件，失败记录为错误事件。

use async_trait::async_trait;
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::{Framework, FrameworkFactory};
use crate::module::content::ModuleContent;
use crate::module::descriptor::parse_version_range;
use crate::module::metadata::{
    package_name, CapabilityRegistration, CapabilityType, ComponentManifest, ComponentSnapshot,
    ComponentState, EventSeverity, FrameworkEvent, ModuleId, ModuleManifest, ModuleSnapshot,
    ModuleState, ScopeId, ServiceObject,
};
use crate::utils::{HarnessError, Result};

/// 为 `true` 时运行时启动失败
pub const FAIL_ON_START_PROPERTY: &str = "chips.framework.fail_on_start";

/// 额外的框架包（逗号分隔），对所有作用域可见
pub const SYSTEM_PACKAGES_PROPERTY: &str = "chips.framework.system.packages";

/// 运行时自身导出的包
const FRAMEWORK_PACKAGES: &[&str] = &["chips.framework", "chips.framework.wiring"];

const FRAMEWORK_SOURCE: &str = "framework";

/// 组件配置就绪的属性名：`component.<name>.configured`
pub fn configured_property(component: &str) -> String {
    format!("component.{}.configured", component)
}

/// 组件实现工厂，激活时创建服务对象
pub type ComponentFactory =
    Arc<dyn Fn(&ComponentManifest) -> anyhow::Result<ServiceObject> + Send + Sync>;

/// 内存运行时工厂
#[derive(Clone, Default)]
pub struct MemoryFrameworkFactory {
    implementations: HashMap<String, ComponentFactory>,
}

impl MemoryFrameworkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册组件实现
    pub fn with_implementation<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ComponentManifest) -> anyhow::Result<ServiceObject> + Send + Sync + 'static,
    {
        self.implementations.insert(name.into(), Arc::new(factory));
        self
    }
}

impl fmt::Debug for MemoryFrameworkFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.implementations.keys().collect();
        names.sort();
        f.debug_struct("MemoryFrameworkFactory")
            .field("implementations", &names)
            .finish()
    }
}

#[async_trait]
impl FrameworkFactory for MemoryFrameworkFactory {
    async fn create(&self, properties: BTreeMap<String, String>) -> Result<Arc<dyn Framework>> {
        Ok(Arc::new(MemoryFramework::new(
            properties,
            self.implementations.clone(),
        )))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Active,
    Stopped,
}

struct InstalledModule {
    manifest: ModuleManifest,
    version: Version,
    state: ModuleState,
    scope: ScopeId,
    origin: String,
}

struct ComponentRecord {
    manifest: ComponentManifest,
    module_id: ModuleId,
    module_name: String,
    scope: ScopeId,
    state: ComponentState,
    failure: Option<String>,
    missing: Vec<String>,
    registration: Option<u64>,
}

struct FrameworkState {
    phase: Phase,
    next_module_id: u64,
    next_registration_id: u64,
    scopes: Vec<String>,
    modules: BTreeMap<ModuleId, InstalledModule>,
    registrations: Vec<CapabilityRegistration>,
    components: Vec<ComponentRecord>,
    events: Vec<FrameworkEvent>,
}

impl FrameworkState {
    fn new() -> Self {
        Self {
            phase: Phase::Created,
            next_module_id: 1,
            next_registration_id: 1,
            scopes: vec!["default".to_string()],
            modules: BTreeMap::new(),
            registrations: vec![],
            components: vec![],
            events: vec![],
        }
    }

    fn record(&mut self, event: FrameworkEvent) {
        match event.severity {
            EventSeverity::Info => debug!(source = %event.source, "{}", event.message),
            EventSeverity::Warning => warn!(source = %event.source, "{}", event.message),
            EventSeverity::Error => error!(source = %event.source, "{}", event.message),
        }
        self.events.push(event);
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        match self.phase {
            Phase::Active => Ok(()),
            Phase::Created => Err(HarnessError::framework(operation, "运行时尚未启动")),
            Phase::Stopped => Err(HarnessError::framework(operation, "运行时已停止")),
        }
    }

    fn module(&self, id: ModuleId, operation: &str) -> Result<&InstalledModule> {
        self.modules
            .get(&id)
            .ok_or_else(|| HarnessError::framework(operation, format!("模块 {} 不存在", id)))
    }

    fn set_module_state(&mut self, id: ModuleId, state: ModuleState) {
        if let Some(module) = self.modules.get_mut(&id) {
            module.state = state;
        }
    }

    fn register(
        &mut self,
        types: &[String],
        properties: BTreeMap<String, serde_json::Value>,
        module_id: ModuleId,
        module_name: &str,
        scope: ScopeId,
        service: Option<ServiceObject>,
    ) -> u64 {
        let registration_id = self.next_registration_id;
        self.next_registration_id += 1;
        self.registrations.push(CapabilityRegistration {
            registration_id,
            types: types.iter().map(|t| CapabilityType::new(t.as_str())).collect(),
            properties,
            module_id,
            module_name: module_name.to_string(),
            scope,
            service,
        });
        debug!(
            registration_id,
            module = %module_name,
            types = ?types,
            "能力已注册"
        );
        registration_id
    }

    fn unregister(&mut self, registration_id: u64) {
        self.registrations
            .retain(|r| r.registration_id != registration_id);
    }

    fn has_visible(&self, scope: ScopeId, capability: &str) -> bool {
        self.registrations
            .iter()
            .any(|r| scope.can_see(r.scope) && r.types.iter().any(|t| t.as_str() == capability))
    }

    /// 模块在其作用域内无法满足的导入
    fn unresolved_imports(&self, id: ModuleId, system_packages: &[String]) -> Vec<String> {
        let Some(module) = self.modules.get(&id) else {
            return vec![];
        };
        module
            .manifest
            .imports
            .iter()
            .filter(|import| {
                let name = package_name(import);
                if system_packages.iter().any(|p| p == name) {
                    return false;
                }
                let range = spec_attribute(import, "version").and_then(|v| parse_version_range(v).ok());
                !self.modules.values().any(|candidate| {
                    module.scope.can_see(candidate.scope)
                        && candidate
                            .manifest
                            .exports
                            .iter()
                            .any(|export| export_satisfies(export, name, range.as_ref()))
                })
            })
            .cloned()
            .collect()
    }

    /// 停止模块：注销能力、移除组件，状态回到 Resolved
    fn stop_module(
        &mut self,
        id: ModuleId,
        properties: &BTreeMap<String, String>,
        implementations: &HashMap<String, ComponentFactory>,
    ) {
        let Some(module) = self.modules.get(&id) else {
            return;
        };
        if !module.state.can_stop() {
            return;
        }
        let name = module.manifest.name.clone();
        self.set_module_state(id, ModuleState::Stopping);

        self.components.retain(|c| c.module_id != id);
        self.registrations.retain(|r| r.module_id != id);
        self.set_module_state(id, ModuleState::Resolved);
        self.record(FrameworkEvent::info(&name, format!("模块 {} 已停止", name)));

        self.reconcile(properties, implementations);
    }

    /// 反复检查组件，直到没有激活或失活发生
    fn reconcile(
        &mut self,
        properties: &BTreeMap<String, String>,
        implementations: &HashMap<String, ComponentFactory>,
    ) {
        loop {
            let mut changed = false;
            for index in 0..self.components.len() {
                let record = &self.components[index];
                if record.state == ComponentState::FailedActivation {
                    continue;
                }

                let configured = !record.manifest.requires_configuration
                    || properties
                        .get(&configured_property(&record.manifest.name))
                        .map(|v| v == "true")
                        .unwrap_or(false);
                let missing: Vec<String> = record
                    .manifest
                    .references
                    .iter()
                    .filter(|reference| !self.has_visible(record.scope, reference))
                    .cloned()
                    .collect();
                let target = if !configured {
                    ComponentState::UnsatisfiedConfiguration
                } else if !missing.is_empty() {
                    ComponentState::UnsatisfiedReference
                } else {
                    ComponentState::Satisfied
                };

                match (record.state, target) {
                    (ComponentState::Active, ComponentState::Satisfied) => {}
                    (ComponentState::Active, _) => {
                        self.deactivate(index, target, missing);
                        changed = true;
                    }
                    (_, ComponentState::Satisfied) => {
                        self.activate(index, implementations);
                        changed = true;
                    }
                    (_, _) => {
                        let record = &mut self.components[index];
                        record.state = target;
                        record.missing = missing;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn activate(&mut self, index: usize, implementations: &HashMap<String, ComponentFactory>) {
        let record = &self.components[index];
        let manifest = record.manifest.clone();
        let (module_id, module_name, scope) =
            (record.module_id, record.module_name.clone(), record.scope);

        let service = match (&manifest.fail_activation, &manifest.implementation) {
            (Some(cause), _) => Err(cause.clone()),
            (None, Some(implementation)) => match implementations.get(implementation) {
                Some(factory) => factory(&manifest).map(Some).map_err(|e| e.to_string()),
                None => Err(format!("未找到组件实现 '{}'", implementation)),
            },
            (None, None) => Ok(None),
        };

        match service {
            Ok(service) => {
                let registration = (!manifest.provides.is_empty()).then(|| {
                    self.register(
                        &manifest.provides,
                        manifest.properties.clone(),
                        module_id,
                        &module_name,
                        scope,
                        service,
                    )
                });
                let record = &mut self.components[index];
                record.state = ComponentState::Active;
                record.registration = registration;
                record.missing.clear();
                self.record(FrameworkEvent::info(
                    &manifest.name,
                    format!("组件 {} 已激活", manifest.name),
                ));
            }
            Err(cause) => {
                let record = &mut self.components[index];
                record.state = ComponentState::FailedActivation;
                record.failure = Some(cause.clone());
                record.missing.clear();
                self.record(FrameworkEvent::error(
                    &manifest.name,
                    format!("组件 {} 激活失败: {}", manifest.name, cause),
                ));
            }
        }
    }

    fn deactivate(&mut self, index: usize, target: ComponentState, missing: Vec<String>) {
        let registration = self.components[index].registration.take();
        if let Some(registration_id) = registration {
            self.unregister(registration_id);
        }
        let record = &mut self.components[index];
        record.state = target;
        record.missing = missing;
        let name = record.manifest.name.clone();
        self.record(FrameworkEvent::new(
            EventSeverity::Warning,
            &name,
            format!("组件 {} 已失活", name),
        ));
    }
}

/// 取包规格中的属性值，例如 `pkg;version="1.0"` 的 `version`
fn spec_attribute<'a>(spec: &'a str, key: &str) -> Option<&'a str> {
    spec.split(';').skip(1).find_map(|part| {
        let (k, v) = part.split_once('=')?;
        (k.trim().trim_end_matches(':').trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

fn export_satisfies(export: &str, name: &str, range: Option<&VersionReq>) -> bool {
    if package_name(export) != name {
        return false;
    }
    let Some(range) = range else {
        return true;
    };
    match spec_attribute(export, "version") {
        Some(raw) => lenient_version(raw).is_some_and(|version| range.matches(&version)),
        None => range.matches(&Version::new(0, 0, 0)),
    }
}

/// 解析包版本，缺少的次版本号与修订号补零（`1.0` 视为 `1.0.0`）
fn lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let parts: Vec<u64> = raw
        .split('.')
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [major] => Some(Version::new(*major, 0, 0)),
        [major, minor] => Some(Version::new(*major, *minor, 0)),
        _ => None,
    }
}

/// 内存运行时
pub struct MemoryFramework {
    properties: BTreeMap<String, String>,
    implementations: HashMap<String, ComponentFactory>,
    system_packages: Vec<String>,
    state: RwLock<FrameworkState>,
}

impl MemoryFramework {
    /// 以给定属性创建运行时
    pub fn new(
        properties: BTreeMap<String, String>,
        implementations: HashMap<String, ComponentFactory>,
    ) -> Self {
        let mut system_packages: Vec<String> =
            FRAMEWORK_PACKAGES.iter().map(|p| p.to_string()).collect();
        if let Some(extra) = properties.get(SYSTEM_PACKAGES_PROPERTY) {
            system_packages.extend(
                extra
                    .split(',')
                    .map(|p| package_name(p).to_string())
                    .filter(|p| !p.is_empty()),
            );
        }

        Self {
            properties,
            implementations,
            system_packages,
            state: RwLock::new(FrameworkState::new()),
        }
    }
}

impl fmt::Debug for MemoryFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFramework")
            .field("properties", &self.properties)
            .finish()
    }
}

#[async_trait]
impl Framework for MemoryFramework {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match state.phase {
            Phase::Active => return Ok(()),
            Phase::Stopped => return Err(HarnessError::framework("start", "运行时已停止")),
            Phase::Created => {}
        }

        if self.property(FAIL_ON_START_PROPERTY).as_deref() == Some("true") {
            state.record(FrameworkEvent::error(FRAMEWORK_SOURCE, "运行时启动失败（按属性要求）"));
            return Err(HarnessError::framework(
                "start",
                format!("属性 {} 要求启动失败", FAIL_ON_START_PROPERTY),
            ));
        }

        state.phase = Phase::Active;
        state.record(FrameworkEvent::info(FRAMEWORK_SOURCE, "运行时已启动"));
        Ok(())
    }

    async fn create_scope(&self, name: &str) -> Result<ScopeId> {
        let mut state = self.state.write().await;
        state.ensure_active("create_scope")?;

        if let Some(index) = state.scopes.iter().position(|s| s == name) {
            return Ok(ScopeId(index as u32));
        }
        state.scopes.push(name.to_string());
        let scope = ScopeId((state.scopes.len() - 1) as u32);
        state.record(FrameworkEvent::info(
            FRAMEWORK_SOURCE,
            format!("已创建隔离作用域 {} ({})", name, scope.0),
        ));
        Ok(scope)
    }

    #[instrument(skip(self, content), fields(origin = %content.origin()))]
    async fn install_module(
        &self,
        scope: ScopeId,
        content: Arc<dyn ModuleContent>,
    ) -> Result<ModuleId> {
        let mut state = self.state.write().await;
        state.ensure_active("install_module")?;
        if scope.0 as usize >= state.scopes.len() {
            return Err(HarnessError::framework(
                "install_module",
                format!("作用域 {} 不存在", scope.0),
            ));
        }

        let manifest = match content.manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                state.record(FrameworkEvent::error(
                    content.origin(),
                    format!("模块清单无效: {}", e),
                ));
                return Err(e);
            }
        };
        let version = manifest.parsed_version()?;

        let id = ModuleId(state.next_module_id);
        state.next_module_id += 1;
        let name = manifest.name.clone();
        state.modules.insert(
            id,
            InstalledModule {
                manifest,
                version,
                state: ModuleState::Installed,
                scope,
                origin: content.origin().to_string(),
            },
        );
        state.record(FrameworkEvent::info(
            &name,
            format!("模块 {} 已安装 ({}, scope {})", name, id, scope.0),
        ));
        Ok(id)
    }

    #[instrument(skip(self), fields(module_id = %id))]
    async fn start_module(&self, id: ModuleId) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_active("start_module")?;

        let module = state.module(id, "start_module")?;
        let name = module.manifest.name.clone();
        match module.state {
            ModuleState::Active => return Ok(()),
            current if !current.can_start() => {
                return Err(HarnessError::InvalidState {
                    module: name,
                    state: current.label().trim().to_string(),
                    operation: "start".to_string(),
                });
            }
            _ => {}
        }

        if module.state == ModuleState::Installed {
            let missing = state.unresolved_imports(id, &self.system_packages);
            if !missing.is_empty() {
                let reason = format!("模块 {} 无法解析，缺少包: {}", name, missing.join(", "));
                state.record(FrameworkEvent::error(&name, reason.clone()));
                return Err(HarnessError::framework("start_module", reason));
            }
            state.set_module_state(id, ModuleState::Resolved);
            state.record(FrameworkEvent::info(&name, format!("模块 {} 已解析", name)));
        }

        state.set_module_state(id, ModuleState::Starting);
        let (manifest, scope) = {
            let module = state.module(id, "start_module")?;
            (module.manifest.clone(), module.scope)
        };

        for capability in &manifest.capabilities {
            state.register(
                &capability.types,
                capability.properties.clone(),
                id,
                &name,
                scope,
                None,
            );
        }
        for component in &manifest.components {
            state.components.push(ComponentRecord {
                manifest: component.clone(),
                module_id: id,
                module_name: name.clone(),
                scope,
                state: ComponentState::UnsatisfiedReference,
                failure: None,
                missing: component.references.clone(),
                registration: None,
            });
        }

        state.set_module_state(id, ModuleState::Active);
        state.record(FrameworkEvent::info(&name, format!("模块 {} 已启动", name)));
        state.reconcile(&self.properties, &self.implementations);
        info!(module = %name, "模块已启动");
        Ok(())
    }

    #[instrument(skip(self), fields(module_id = %id))]
    async fn stop_module(&self, id: ModuleId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.phase != Phase::Active {
            return Ok(());
        }
        state.module(id, "stop_module")?;
        state.stop_module(id, &self.properties, &self.implementations);
        Ok(())
    }

    #[instrument(skip(self), fields(module_id = %id))]
    async fn uninstall_module(&self, id: ModuleId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.phase == Phase::Stopped {
            return Ok(());
        }
        if !state.modules.contains_key(&id) {
            return Ok(());
        }
        state.stop_module(id, &self.properties, &self.implementations);

        if let Some(module) = state.modules.remove(&id) {
            let name = module.manifest.name;
            state.record(FrameworkEvent::info(&name, format!("模块 {} 已卸载", name)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.phase == Phase::Stopped {
            return Ok(());
        }

        let ids: Vec<ModuleId> = state.modules.keys().rev().copied().collect();
        for id in ids {
            state.stop_module(id, &self.properties, &self.implementations);
        }
        state.modules.clear();
        state.registrations.clear();
        state.components.clear();
        state.phase = Phase::Stopped;
        state.record(FrameworkEvent::info(FRAMEWORK_SOURCE, "运行时已停止"));
        Ok(())
    }

    async fn modules(&self) -> Vec<ModuleSnapshot> {
        let state = self.state.read().await;
        state
            .modules
            .iter()
            .map(|(id, module)| ModuleSnapshot {
                id: *id,
                name: module.manifest.name.clone(),
                version: module.version.to_string(),
                state: module.state,
                scope: module.scope,
                origin: module.origin.clone(),
            })
            .collect()
    }

    async fn components(&self) -> Vec<ComponentSnapshot> {
        let state = self.state.read().await;
        state
            .components
            .iter()
            .map(|record| ComponentSnapshot {
                name: record.manifest.name.clone(),
                module: record.module_name.clone(),
                scope: record.scope,
                state: record.state,
                failure: record.failure.clone(),
                unsatisfied_references: record.missing.clone(),
            })
            .collect()
    }

    async fn capabilities(&self) -> Vec<CapabilityRegistration> {
        self.state.read().await.registrations.clone()
    }

    async fn events(&self) -> Vec<FrameworkEvent> {
        self.state.read().await.events.clone()
    }

    fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }
}
