//! 声明模型
//!
//! 测试实体（测试类、嵌套测试等）上附加的声明：模块、运行时属性、导出包，
//! 以及它们的容器形式和组合声明。声明只是输入数据，解析逻辑在
//! [`DescriptorResolver`](super::resolver::DescriptorResolver) 中。
//!
//! 声明可以用构建器 API 编写，也可以从 YAML/JSON 计划文件加载：
//!
//! ```yaml
//! scope:
//!   name: my::ImplTest
//!   declarations:
//!     - kind: module
//!       identity: api-module
//!     - kind: module
//!       identity: impl-module
//!       start: true
//!       isolated: true
//!     - kind: composite
//!       name: component-runtime
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::descriptor::{ModuleRequirement, PropertyRequirement};
use crate::utils::Result;

/// 内置组合声明：声明式组件运行时
pub const COMPONENT_RUNTIME_COMPOSITE: &str = "component-runtime";

/// 组件运行时模块名
pub const COMPONENT_RUNTIME_MODULE: &str = "chips.component.runtime";

/// 单条声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Declaration {
    /// 单个模块需求
    Module(ModuleRequirement),
    /// 重复模块需求的容器形式
    Modules { modules: Vec<ModuleRequirement> },
    /// 单个运行时属性
    Property(PropertyRequirement),
    /// 重复属性的容器形式
    Properties { properties: Vec<PropertyRequirement> },
    /// 单个导出包
    Export { spec: String },
    /// 重复导出包的容器形式
    Exports { exports: Vec<String> },
    /// 组合声明（按名称展开为一组固定的声明）
    Composite { name: String },
}

/// 测试实体的声明
///
/// `parent` 为外层（或祖先）实体，其声明先于本实体生效。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDeclaration {
    /// 实体名（通常即作用域键）
    pub name: String,

    /// 按源码顺序排列的声明
    #[serde(default)]
    pub declarations: Vec<Declaration>,

    /// 外层实体
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ScopeDeclaration>>,
}

impl ScopeDeclaration {
    /// 创建空声明
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declarations: vec![],
            parent: None,
        }
    }

    /// 设置外层实体
    pub fn with_parent(mut self, parent: ScopeDeclaration) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// 追加任意声明
    pub fn declare(mut self, declaration: Declaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// 追加模块需求
    pub fn with_module(self, requirement: ModuleRequirement) -> Self {
        self.declare(Declaration::Module(requirement))
    }

    /// 追加运行时属性
    pub fn with_property(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.declare(Declaration::Property(PropertyRequirement::new(key, value)))
    }

    /// 追加导出包
    pub fn with_export(self, spec: impl Into<String>) -> Self {
        self.declare(Declaration::Export { spec: spec.into() })
    }

    /// 追加组合声明
    pub fn with_composite(self, name: impl Into<String>) -> Self {
        self.declare(Declaration::Composite { name: name.into() })
    }

    /// 祖先链，最外层在前，本实体在最后
    pub fn ancestry(&self) -> Vec<&ScopeDeclaration> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(scope) = current {
            chain.push(scope);
            current = scope.parent.as_deref();
        }
        chain.reverse();
        chain
    }
}

/// 组合声明注册表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeRegistry {
    composites: BTreeMap<String, Vec<Declaration>>,
}

impl CompositeRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置组合声明的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            COMPONENT_RUNTIME_COMPOSITE,
            vec![
                Declaration::Module(
                    ModuleRequirement::new(COMPONENT_RUNTIME_MODULE)
                        .started()
                        .isolated(),
                ),
                Declaration::Module(ModuleRequirement::new("chips.util.promise")),
                Declaration::Module(ModuleRequirement::new("chips.util.function")),
                Declaration::Module(ModuleRequirement::new("chips.service.component")),
            ],
        );
        registry
    }

    /// 注册（或替换）组合声明
    pub fn register(&mut self, name: impl Into<String>, declarations: Vec<Declaration>) {
        self.composites.insert(name.into(), declarations);
    }

    /// 查找组合声明
    pub fn get(&self, name: &str) -> Option<&[Declaration]> {
        self.composites.get(name).map(Vec::as_slice)
    }

    /// 合并另一个注册表，同名时以 `other` 为准
    pub fn extend(&mut self, other: CompositeRegistry) {
        self.composites.extend(other.composites);
    }

    /// 已注册的组合声明名称
    pub fn names(&self) -> Vec<&str> {
        self.composites.keys().map(String::as_str).collect()
    }
}

/// 计划文件
///
/// CLI 与外部工具使用的声明载体：自定义组合声明 + 测试实体声明。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    /// 自定义组合声明
    #[serde(default)]
    pub composites: CompositeRegistry,

    /// 测试实体声明
    pub scope: ScopeDeclaration,
}

impl PlanFile {
    /// 从文件加载（.json 按 JSON 解析，其余按 YAML 解析）
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::parse_yaml(&content)
        }
    }

    /// 从 YAML 字符串解析
    pub fn parse_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// 内置组合声明 + 文件中的组合声明
    pub fn composite_registry(&self) -> CompositeRegistry {
        let mut registry = CompositeRegistry::with_builtins();
        registry.extend(self.composites.clone());
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestry_is_outermost_first() {
        let outer = ScopeDeclaration::new("Outer");
        let middle = ScopeDeclaration::new("Middle").with_parent(outer);
        let inner = ScopeDeclaration::new("Inner").with_parent(middle);

        let names: Vec<_> = inner.ancestry().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Outer", "Middle", "Inner"]);
    }

    #[test]
    fn test_builtin_component_runtime() {
        let registry = CompositeRegistry::with_builtins();
        let expanded = registry.get(COMPONENT_RUNTIME_COMPOSITE).unwrap();
        assert_eq!(expanded.len(), 4);
        match &expanded[0] {
            Declaration::Module(req) => {
                assert_eq!(req.identity, COMPONENT_RUNTIME_MODULE);
                assert!(req.start && req.isolated);
            }
            other => panic!("unexpected declaration: {:?}", other),
        }
    }

    #[test]
    fn test_plan_file_yaml() {
        let yaml = r#"
composites:
  api-stack:
    - kind: module
      identity: api-module
    - kind: export
      spec: my.extra;version="1.0.0"
scope:
  name: my::ImplTest
  declarations:
    - kind: composite
      name: api-stack
    - kind: module
      identity: impl-module
      start: true
      isolated: true
      group: g1
    - kind: properties
      properties:
        - { key: level, value: "5" }
  parent:
    name: my::Base
    declarations:
      - kind: exports
        exports: [base.pkg]
"#;
        let plan = PlanFile::parse_yaml(yaml).unwrap();
        assert_eq!(plan.scope.name, "my::ImplTest");
        assert_eq!(plan.scope.declarations.len(), 3);
        assert_eq!(plan.scope.parent.as_ref().unwrap().name, "my::Base");

        let registry = plan.composite_registry();
        assert!(registry.get("api-stack").is_some());
        assert!(registry.get(COMPONENT_RUNTIME_COMPOSITE).is_some());
    }
}
