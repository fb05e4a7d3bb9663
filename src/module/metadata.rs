//! 模块元数据定义
//!
//! 包含两部分：
//! - 模块清单 (module.yaml)：模块内容中描述自身的文件
//! - 运行时快照：模块、组件、能力注册与生命周期事件，供注入与诊断读取

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::utils::{generate_uuid, HarnessError, Result};

/// 模块清单文件名
pub const MANIFEST_FILENAME: &str = "module.yaml";

// ==================== 模块清单 ====================

/// 能力声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    /// 对外公布的类型标识
    pub types: Vec<String>,

    /// 注册属性
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// 组件声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// 组件名
    pub name: String,

    /// 激活后注册的能力类型
    #[serde(default)]
    pub provides: Vec<String>,

    /// 引用的能力类型（全部可见时组件才满足）
    #[serde(default)]
    pub references: Vec<String>,

    /// 需要配置才能满足（对应的运行时属性 `component.<name>.configured`）
    #[serde(default)]
    pub requires_configuration: bool,

    /// 实现名，激活时通过运行时工厂创建服务对象
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,

    /// 激活时必然失败并携带的原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_activation: Option<String>,

    /// 注册属性
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// 模块清单
///
/// 对应模块内容根目录下的 module.yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// 模块名
    pub name: String,

    /// 模块版本（semver 格式）
    pub version: String,

    /// 导入的包
    #[serde(default)]
    pub imports: Vec<String>,

    /// 导出的包
    #[serde(default)]
    pub exports: Vec<String>,

    /// 启动后直接注册的能力
    #[serde(default)]
    pub capabilities: Vec<CapabilityManifest>,

    /// 声明式组件
    #[serde(default)]
    pub components: Vec<ComponentManifest>,
}

impl ModuleManifest {
    /// 创建空清单
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            imports: vec![],
            exports: vec![],
            capabilities: vec![],
            components: vec![],
        }
    }

    /// 从 YAML 字符串解析并验证
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        manifest.parsed_version()?;
        if manifest.name.trim().is_empty() {
            return Err(HarnessError::Declaration {
                identity: manifest.name,
                reason: "清单中的模块名不能为空".to_string(),
            });
        }
        Ok(manifest)
    }

    /// 解析版本号
    pub fn parsed_version(&self) -> Result<Version> {
        Ok(Version::parse(&self.version)?)
    }

    /// 序列化为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// 包规格中的包名部分
pub fn package_name(spec: &str) -> &str {
    spec.split(';').next().unwrap_or_default().trim()
}

// ==================== 运行时快照 ====================

/// 运行时内的作用域（默认组为 `ScopeId::DEFAULT`，隔离组各有一个）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl ScopeId {
    /// 默认组
    pub const DEFAULT: ScopeId = ScopeId(0);

    /// `self` 中的模块能否看到 `owner` 中注册的内容
    ///
    /// 默认组对所有组可见；隔离组只对自身可见。
    pub fn can_see(self, owner: ScopeId) -> bool {
        owner == ScopeId::DEFAULT || owner == self
    }
}

/// 已安装模块的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 模块状态
///
/// 判别值即诊断报告的排序键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// 已卸载（终态）
    Uninstalled = 1,
    /// 已安装
    Installed = 2,
    /// 已解析
    Resolved = 4,
    /// 正在启动
    Starting = 8,
    /// 正在停止
    Stopping = 16,
    /// 运行中
    Active = 32,
}

impl ModuleState {
    /// 排序键
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// 报告中使用的定宽标签
    pub fn label(self) -> &'static str {
        match self {
            ModuleState::Uninstalled => "UNINSTALLED",
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED ",
            ModuleState::Starting => "STARTING ",
            ModuleState::Stopping => "STOPPING ",
            ModuleState::Active => "ACTIVE   ",
        }
    }

    /// 从报告标签解析状态
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "UNINSTALLED" => Some(ModuleState::Uninstalled),
            "INSTALLED" => Some(ModuleState::Installed),
            "RESOLVED" => Some(ModuleState::Resolved),
            "STARTING" => Some(ModuleState::Starting),
            "STOPPING" => Some(ModuleState::Stopping),
            "ACTIVE" => Some(ModuleState::Active),
            _ => None,
        }
    }

    /// 是否可以启动
    pub fn can_start(self) -> bool {
        matches!(self, ModuleState::Installed | ModuleState::Resolved)
    }

    /// 是否可以停止
    pub fn can_stop(self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Starting)
    }
}

/// 组件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    /// 缺少配置
    UnsatisfiedConfiguration = 1,
    /// 缺少引用
    UnsatisfiedReference = 2,
    /// 已满足
    Satisfied = 4,
    /// 已激活
    Active = 8,
    /// 激活失败
    FailedActivation = 16,
}

impl ComponentState {
    /// 排序键
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// 报告中使用的标签
    pub fn label(self) -> &'static str {
        match self {
            ComponentState::Active => "ACTIVE ",
            ComponentState::FailedActivation => "FAILED ",
            ComponentState::Satisfied => "SATISFIED ",
            ComponentState::UnsatisfiedConfiguration | ComponentState::UnsatisfiedReference => {
                "UNSATISFIED"
            }
        }
    }

    /// 是否为问题状态（未满足或激活失败）
    pub fn is_problem(self) -> bool {
        matches!(
            self,
            ComponentState::UnsatisfiedConfiguration
                | ComponentState::UnsatisfiedReference
                | ComponentState::FailedActivation
        )
    }
}

/// 模块快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub id: ModuleId,
    pub name: String,
    pub version: String,
    pub state: ModuleState,
    pub scope: ScopeId,
    /// 内容来源（目录路径或 `archive.tar!/name/`）
    pub origin: String,
}

/// 组件快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub name: String,
    pub module: String,
    pub scope: ScopeId,
    pub state: ComponentState,
    /// 激活失败原因
    pub failure: Option<String>,
    /// 缺失的引用
    pub unsatisfied_references: Vec<String>,
}

/// 能力类型标识
///
/// 注册时给出的稳定标识，注入时以同一标识查询。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityType(pub String);

impl CapabilityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 服务对象
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// 能力注册
#[derive(Clone)]
pub struct CapabilityRegistration {
    /// 注册序号（单调递增，即注册顺序）
    pub registration_id: u64,
    /// 公布的类型
    pub types: Vec<CapabilityType>,
    /// 注册属性
    pub properties: BTreeMap<String, Value>,
    /// 所属模块（仅回指，不拥有）
    pub module_id: ModuleId,
    pub module_name: String,
    /// 所属作用域
    pub scope: ScopeId,
    /// 服务对象（声明式能力可能没有）
    pub service: Option<ServiceObject>,
}

impl CapabilityRegistration {
    /// 是否公布了指定类型
    pub fn advertises(&self, capability: &CapabilityType) -> bool {
        self.types.iter().any(|t| t == capability)
    }

    /// 以具体类型取出服务对象
    pub fn service_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.service.clone().and_then(|s| s.downcast::<T>().ok())
    }
}

impl fmt::Debug for CapabilityRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistration")
            .field("registration_id", &self.registration_id)
            .field("types", &self.types)
            .field("properties", &self.properties)
            .field("module_name", &self.module_name)
            .field("scope", &self.scope)
            .field("has_service", &self.service.is_some())
            .finish()
    }
}

/// 事件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkEvent {
    /// 事件唯一标识
    pub event_id: String,
    /// 级别
    pub severity: EventSeverity,
    /// 来源（模块名或组件名，框架自身为 "framework"）
    pub source: String,
    /// 描述
    pub message: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
}

impl FrameworkEvent {
    /// 创建新事件
    pub fn new(severity: EventSeverity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: generate_uuid(),
            severity,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Info, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Error, source, message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == EventSeverity::Error
    }
}

impl fmt::Display for FrameworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.source, self.message)
    }
}
