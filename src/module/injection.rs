//! 参数注入
//!
//! 测试方法的参数通过标记声明需要注入的内容：
//! - [`InjectionMarker::Runtime`]：当前作用域的运行时实例，参数类型必须为 [`RUNTIME_HANDLE_TYPE`]
//! - [`InjectionMarker::Capability`]：默认组可见、类型匹配的首个能力注册（按注册顺序），
//!   可附加属性过滤条件
//!
//! 注入只读，不会改变运行时状态。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::lifecycle::{RuntimeInstance, RuntimeLifecycleManager};
use super::metadata::{CapabilityRegistration, CapabilityType};
use crate::utils::{HarnessError, Result};

/// 运行时句柄的类型标识
pub const RUNTIME_HANDLE_TYPE: &str = "chips_testkit::RuntimeInstance";

/// 能力注册的属性过滤条件，全部键值相等时匹配
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyFilter {
    properties: BTreeMap<String, Value>,
}

impl PropertyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个键值条件
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 检查注册是否满足条件
    pub fn matches(&self, registration: &CapabilityRegistration) -> bool {
        self.properties
            .iter()
            .all(|(key, value)| registration.properties.get(key) == Some(value))
    }
}

/// 注入标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InjectionMarker {
    /// 注入运行时实例
    Runtime,
    /// 注入能力
    Capability {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<PropertyFilter>,
    },
}

/// 测试方法参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// 参数名
    pub name: String,
    /// 声明类型（能力参数即能力类型标识）
    pub declared_type: String,
    /// 注入标记
    #[serde(default)]
    pub marker: Option<InjectionMarker>,
}

impl Parameter {
    /// 未标记的参数
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            marker: None,
        }
    }

    /// 运行时参数
    pub fn runtime(name: impl Into<String>) -> Self {
        Self {
            marker: Some(InjectionMarker::Runtime),
            ..Self::new(name, RUNTIME_HANDLE_TYPE)
        }
    }

    /// 能力参数
    pub fn capability(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            marker: Some(InjectionMarker::Capability { filter: None }),
            ..Self::new(name, capability)
        }
    }

    /// 为能力参数附加过滤条件
    pub fn with_filter(mut self, filter: PropertyFilter) -> Self {
        if let Some(InjectionMarker::Capability { filter: ref mut current }) = self.marker {
            *current = Some(filter);
        }
        self
    }
}

/// 注入结果
#[derive(Debug, Clone)]
pub enum Injected {
    /// 运行时实例
    Runtime(Arc<RuntimeInstance>),
    /// 能力注册
    Capability(CapabilityRegistration),
}

impl Injected {
    /// 取出运行时实例
    pub fn into_runtime(self) -> Option<Arc<RuntimeInstance>> {
        match self {
            Injected::Runtime(instance) => Some(instance),
            Injected::Capability(_) => None,
        }
    }

    /// 取出能力注册
    pub fn into_capability(self) -> Option<CapabilityRegistration> {
        match self {
            Injected::Capability(registration) => Some(registration),
            Injected::Runtime(_) => None,
        }
    }
}

/// 在实例中查找默认组可见的首个匹配能力
pub async fn lookup_capability(
    instance: &RuntimeInstance,
    capability: &CapabilityType,
    filter: Option<&PropertyFilter>,
) -> Result<CapabilityRegistration> {
    let mut candidates: Vec<CapabilityRegistration> = instance
        .visible_capabilities()
        .await
        .into_iter()
        .filter(|r| r.advertises(capability))
        .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
        .collect();
    candidates.sort_by_key(|r| r.registration_id);

    let first = candidates
        .into_iter()
        .next()
        .ok_or_else(|| HarnessError::CapabilityUnavailable(capability.to_string()))?;
    debug!(
        scope = %instance.scope_key(),
        capability_type = %capability,
        registration_id = first.registration_id,
        module = %first.module_name,
        "能力已注入"
    );
    Ok(first)
}

/// 注入解析器
#[derive(Debug, Clone)]
pub struct InjectionResolver {
    lifecycle: Arc<RuntimeLifecycleManager>,
}

impl InjectionResolver {
    pub fn new(lifecycle: Arc<RuntimeLifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// 参数是否可以注入
    pub fn supports(&self, parameter: &Parameter) -> bool {
        match parameter.marker {
            Some(InjectionMarker::Runtime) => parameter.declared_type == RUNTIME_HANDLE_TYPE,
            Some(InjectionMarker::Capability { .. }) => !parameter.declared_type.trim().is_empty(),
            None => false,
        }
    }

    /// 解析参数
    ///
    /// # Errors
    ///
    /// - 参数不支持注入：`InjectionUnsupported`
    /// - 作用域尚无运行时：`NoRuntimeForScope`
    /// - 没有匹配的能力：`CapabilityUnavailable`
    pub async fn resolve(&self, parameter: &Parameter, scope_key: &str) -> Result<Injected> {
        if !self.supports(parameter) {
            return Err(HarnessError::InjectionUnsupported {
                parameter: parameter.name.clone(),
                reason: match parameter.marker {
                    None => "未声明注入标记".to_string(),
                    Some(_) => format!("声明类型 '{}' 不可注入", parameter.declared_type),
                },
            });
        }

        let instance = self
            .lifecycle
            .get(scope_key)
            .await
            .ok_or_else(|| HarnessError::NoRuntimeForScope(scope_key.to_string()))?;

        match parameter.marker {
            Some(InjectionMarker::Capability { ref filter }) => {
                let capability = CapabilityType::new(parameter.declared_type.as_str());
                lookup_capability(&instance, &capability, filter.as_ref())
                    .await
                    .map(Injected::Capability)
            }
            _ => Ok(Injected::Runtime(instance)),
        }
    }

    /// 按类型取出能力的服务对象
    pub async fn capability<T: Any + Send + Sync>(
        &self,
        scope_key: &str,
        capability: &str,
    ) -> Result<Arc<T>> {
        let parameter = Parameter::capability(capability, capability);
        let registration = self
            .resolve(&parameter, scope_key)
            .await?
            .into_capability()
            .ok_or_else(|| HarnessError::CapabilityUnavailable(capability.to_string()))?;
        registration
            .service_as::<T>()
            .ok_or_else(|| HarnessError::InjectionUnsupported {
                parameter: capability.to_string(),
                reason: "服务对象类型不匹配".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HarnessConfig;
    use crate::module::content::ClasspathContentProvider;
    use crate::module::declaration::ScopeDeclaration;
    use crate::module::descriptor::ModuleRequirement;
    use crate::module::metadata::{ModuleId, ScopeId, ServiceObject, MANIFEST_FILENAME};
    use crate::module::resolver::DescriptorResolver;
    use crate::module::runtime::MemoryFrameworkFactory;
    use tempfile::TempDir;

    fn registration(id: u64, properties: &[(&str, Value)]) -> CapabilityRegistration {
        CapabilityRegistration {
            registration_id: id,
            types: vec![CapabilityType::new("my.Greeter")],
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            module_id: ModuleId(1),
            module_name: "m".into(),
            scope: ScopeId::DEFAULT,
            service: None,
        }
    }

    #[test]
    fn test_property_filter() {
        let filter = PropertyFilter::new().with("lang", "en");
        assert!(filter.matches(&registration(1, &[("lang", Value::from("en"))])));
        assert!(!filter.matches(&registration(2, &[("lang", Value::from("de"))])));
        assert!(!filter.matches(&registration(3, &[])));
        assert!(PropertyFilter::new().matches(&registration(4, &[])));
    }

    async fn setup() -> (TempDir, Arc<RuntimeLifecycleManager>) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("greeter");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILENAME),
            r#"
name: greeter
version: 1.0.0
components:
  - name: EnglishGreeter
    provides: [my.Greeter]
    implementation: english
    properties: { lang: en }
  - name: GermanGreeter
    provides: [my.Greeter]
    implementation: german
    properties: { lang: de }
"#,
        )
        .unwrap();

        let config = HarnessConfig::builder()
            .search_root(temp.path())
            .ignore_env_search_path()
            .build();
        let factory = MemoryFrameworkFactory::new()
            .with_implementation("english", |_| Ok(Arc::new("hello".to_string()) as ServiceObject))
            .with_implementation("german", |_| Ok(Arc::new("hallo".to_string()) as ServiceObject));
        let lifecycle = Arc::new(RuntimeLifecycleManager::new(
            Arc::new(factory),
            ClasspathContentProvider::from_config(&config),
            &config,
        ));

        let requirements = DescriptorResolver::new().resolve(
            &ScopeDeclaration::new("T").with_module(ModuleRequirement::new("greeter").started()),
        );
        lifecycle.acquire("T", &requirements).await.unwrap();
        (temp, lifecycle)
    }

    #[tokio::test]
    async fn test_supports() {
        let (_temp, lifecycle) = setup().await;
        let resolver = InjectionResolver::new(lifecycle);

        assert!(resolver.supports(&Parameter::runtime("rt")));
        assert!(resolver.supports(&Parameter::capability("g", "my.Greeter")));
        assert!(!resolver.supports(&Parameter::new("x", RUNTIME_HANDLE_TYPE)));
        assert!(!resolver.supports(&Parameter {
            marker: Some(InjectionMarker::Runtime),
            ..Parameter::new("x", "String")
        }));
    }

    #[tokio::test]
    async fn test_resolve_capability_first_by_registration_order() {
        let (_temp, lifecycle) = setup().await;
        let resolver = InjectionResolver::new(lifecycle);

        let greeting: Arc<String> = resolver.capability("T", "my.Greeter").await.unwrap();
        assert_eq!(greeting.as_str(), "hello");

        let german = resolver
            .resolve(
                &Parameter::capability("g", "my.Greeter")
                    .with_filter(PropertyFilter::new().with("lang", "de")),
                "T",
            )
            .await
            .unwrap()
            .into_capability()
            .unwrap();
        assert_eq!(german.service_as::<String>().unwrap().as_str(), "hallo");
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (_temp, lifecycle) = setup().await;
        let resolver = InjectionResolver::new(lifecycle);

        let err = resolver
            .resolve(&Parameter::capability("m", "my.Missing"), "T")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::CapabilityUnavailable(ref t) if t == "my.Missing"));

        let err = resolver
            .resolve(&Parameter::runtime("rt"), "Other")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NoRuntimeForScope(_)));

        let err = resolver
            .resolve(&Parameter::new("x", "String"), "T")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InjectionUnsupported { .. }));

        let runtime = resolver
            .resolve(&Parameter::runtime("rt"), "T")
            .await
            .unwrap()
            .into_runtime()
            .unwrap();
        assert_eq!(runtime.scope_key(), "T");
    }
}
