//! 需求解析器
//!
//! 把测试实体及其祖先链上的声明合并为一个安装计划、一个属性列表和一个导出包列表。
//!
//! 规则：
//! - 祖先的声明在前（最外层祖先最先），本实体的声明在后，各自保持源码顺序
//! - 容器形式原地展开
//! - 组合声明在出现位置原地展开，可以嵌套；循环或未知的组合声明记为问题并跳过
//! - 模块需求按（标识, 隔离标志, 隔离组）去重，保留首次出现的那个
//!
//! 解析本身不会失败，也不解析模块标识；标识错误在安装时才暴露。
//!
//! # 示例
//!
//! ```
//! use chips_testkit::module::{DescriptorResolver, ModuleRequirement, ScopeDeclaration};
//!
//! let base = ScopeDeclaration::new("Base").with_module(ModuleRequirement::new("api"));
//! let scope = ScopeDeclaration::new("ImplTest")
//!     .with_parent(base)
//!     .with_module(ModuleRequirement::new("impl").started().isolated_in("g1"))
//!     .with_property("level", "5");
//!
//! let resolved = DescriptorResolver::new().resolve(&scope);
//! assert_eq!(resolved.plan.default_group[0].identity, "api");
//! assert_eq!(resolved.plan.group("g1").unwrap().modules[0].identity, "impl");
//! assert_eq!(resolved.effective_properties(&Default::default())["level"], "5");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::declaration::{CompositeRegistry, Declaration, ScopeDeclaration};
use super::descriptor::{
    collapse_properties, ExportRequirement, InstallationPlan, PropertyRequirement,
};

/// 解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRequirements {
    /// 安装计划
    pub plan: InstallationPlan,
    /// 属性需求（声明顺序）
    pub properties: Vec<PropertyRequirement>,
    /// 导出包需求（声明顺序，已去重）
    pub exports: Vec<ExportRequirement>,
    /// 声明问题（未知或循环的组合声明）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

impl ResolvedRequirements {
    /// 最终属性表：默认属性在下，声明的属性覆盖其上，同名后者优先
    pub fn effective_properties(
        &self,
        defaults: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut merged = defaults.clone();
        merged.extend(collapse_properties(&self.properties));
        merged
    }

    /// 导出包规格字符串
    pub fn export_specs(&self) -> Vec<String> {
        self.exports.iter().map(|e| e.spec.clone()).collect()
    }
}

/// 需求解析器
#[derive(Debug, Clone)]
pub struct DescriptorResolver {
    composites: CompositeRegistry,
}

impl Default for DescriptorResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorResolver {
    /// 使用内置组合声明创建解析器
    pub fn new() -> Self {
        Self {
            composites: CompositeRegistry::with_builtins(),
        }
    }

    /// 使用指定的组合声明注册表
    pub fn with_composites(composites: CompositeRegistry) -> Self {
        Self { composites }
    }

    /// 组合声明注册表
    pub fn composites(&self) -> &CompositeRegistry {
        &self.composites
    }

    /// 解析测试实体的声明
    pub fn resolve(&self, scope: &ScopeDeclaration) -> ResolvedRequirements {
        let mut resolved = ResolvedRequirements::default();
        let mut expanding = Vec::new();

        for entity in scope.ancestry() {
            for declaration in &entity.declarations {
                self.apply(declaration, &mut resolved, &mut expanding);
            }
        }

        debug!(
            scope = %scope.name,
            modules = resolved.plan.len(),
            groups = resolved.plan.isolation_groups.len(),
            properties = resolved.properties.len(),
            exports = resolved.exports.len(),
            "需求解析完成"
        );
        resolved
    }

    fn apply(
        &self,
        declaration: &Declaration,
        resolved: &mut ResolvedRequirements,
        expanding: &mut Vec<String>,
    ) {
        match declaration {
            Declaration::Module(requirement) => {
                resolved.plan.push(requirement.clone());
            }
            Declaration::Modules { modules } => {
                for requirement in modules {
                    resolved.plan.push(requirement.clone());
                }
            }
            Declaration::Property(property) => resolved.properties.push(property.clone()),
            Declaration::Properties { properties } => {
                resolved.properties.extend(properties.iter().cloned())
            }
            Declaration::Export { spec } => push_export(resolved, spec),
            Declaration::Exports { exports } => {
                for spec in exports {
                    push_export(resolved, spec);
                }
            }
            Declaration::Composite { name } => {
                if expanding.iter().any(|n| n == name) {
                    let problem = format!(
                        "组合声明循环引用: {} -> {}",
                        expanding.join(" -> "),
                        name
                    );
                    warn!("{}", problem);
                    resolved.problems.push(problem);
                    return;
                }
                let Some(constituents) = self.composites.get(name) else {
                    let problem = format!("未知的组合声明: '{}'", name);
                    warn!("{}", problem);
                    resolved.problems.push(problem);
                    return;
                };

                expanding.push(name.clone());
                for constituent in constituents {
                    self.apply(constituent, resolved, expanding);
                }
                expanding.pop();
            }
        }
    }
}

fn push_export(resolved: &mut ResolvedRequirements, spec: &str) {
    let spec = spec.trim();
    if spec.is_empty() || resolved.exports.iter().any(|e| e.spec == spec) {
        return;
    }
    resolved.exports.push(ExportRequirement::new(spec));
}
