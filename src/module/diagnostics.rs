//! 诊断与状态报告
//!
//! 把运行时的模块、能力与组件以确定的顺序逐行写入调用方提供的输出，
//! 以及检查运行时是否无错误。
//!
//! 行格式：
//! - 模块：`{状态标签} | {模块名} ({版本})`，按（状态, 名称忽略大小写）排序
//! - 能力：`{类型或 [t1, t2]} registered by {模块名} | {属性}`
//! - 组件：`{状态标签} | {组件名}`，激活失败追加 ` | {原因}`，每个缺失引用另起一行
//!   `\t{引用} is missing`

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::info;

use super::declaration::COMPONENT_RUNTIME_MODULE;
use super::metadata::{
    CapabilityRegistration, ComponentSnapshot, ComponentState, ModuleSnapshot, ModuleState,
};
use super::runtime::Framework;
use crate::utils::{HarnessError, Result};

pub const MODULES_HEADER: &str = "============ Framework Modules ==================";
pub const CAPABILITIES_HEADER: &str = "============ Registered Capabilities ==================";
pub const COMPONENTS_HEADER: &str = "============ Framework Components ==================";
pub const NO_COMPONENT_RUNTIME: &str =
    "No component runtime installed (or started) in this framework!";

fn by_name_ignore_case(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// 模块报告行（不含标题）
pub fn module_report_lines(modules: &[ModuleSnapshot]) -> Vec<String> {
    let mut sorted: Vec<&ModuleSnapshot> = modules.iter().collect();
    sorted.sort_by(|a, b| {
        a.state
            .ordinal()
            .cmp(&b.state.ordinal())
            .then_with(|| by_name_ignore_case(&a.name, &b.name))
    });
    sorted
        .into_iter()
        .map(|m| format!("{} | {} ({})", m.state.label(), m.name, m.version))
        .collect()
}

/// 从模块报告行解析出排序键（状态, 模块名）
pub fn parse_module_line(line: &str) -> Option<(ModuleState, String)> {
    let (label, rest) = line.split_once(" | ")?;
    let state = ModuleState::from_label(label)?;
    let name = rest.rsplit_once(" (").map(|(name, _)| name).unwrap_or(rest);
    Some((state, name.to_string()))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_properties(properties: &BTreeMap<String, Value>) -> String {
    let pairs: Vec<String> = properties
        .iter()
        .map(|(k, v)| format!("{}={}", k, render_value(v)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// 能力报告行（不含标题），按所属模块、注册顺序排列
pub fn capability_report_lines(registrations: &[CapabilityRegistration]) -> Vec<String> {
    let mut sorted: Vec<&CapabilityRegistration> = registrations.iter().collect();
    sorted.sort_by_key(|r| (r.module_id, r.registration_id));
    sorted
        .into_iter()
        .map(|r| {
            let types = match r.types.as_slice() {
                [single] => single.to_string(),
                many => format!(
                    "[{}]",
                    many.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
                ),
            };
            format!(
                "{} registered by {} | {}",
                types,
                r.module_name,
                render_properties(&r.properties)
            )
        })
        .collect()
}

/// 组件报告行（不含标题）
pub fn component_report_lines(components: &[ComponentSnapshot]) -> Vec<String> {
    let mut sorted: Vec<&ComponentSnapshot> = components.iter().collect();
    sorted.sort_by(|a, b| {
        a.state
            .ordinal()
            .cmp(&b.state.ordinal())
            .then_with(|| by_name_ignore_case(&a.name, &b.name))
    });

    let mut lines = Vec::new();
    for component in sorted {
        match (component.state, &component.failure) {
            (ComponentState::FailedActivation, Some(cause)) => lines.push(format!(
                "{} | {} | {}",
                component.state.label(),
                component.name,
                cause
            )),
            _ => lines.push(format!("{} | {}", component.state.label(), component.name)),
        }
        for reference in &component.unsatisfied_references {
            lines.push(format!("\t{} is missing", reference));
        }
    }
    lines
}

/// 输出模块报告
pub async fn print_modules(framework: &dyn Framework, sink: &mut dyn FnMut(String)) {
    sink(MODULES_HEADER.to_string());
    for line in module_report_lines(&framework.modules().await) {
        sink(line);
    }
}

/// 输出能力报告
pub async fn print_capabilities(framework: &dyn Framework, sink: &mut dyn FnMut(String)) {
    sink(CAPABILITIES_HEADER.to_string());
    for line in capability_report_lines(&framework.capabilities().await) {
        sink(line);
    }
}

/// 输出组件报告
pub async fn print_components(framework: &dyn Framework, sink: &mut dyn FnMut(String)) {
    let components = framework.components().await;
    let runtime_active = framework
        .modules()
        .await
        .iter()
        .any(|m| m.name == COMPONENT_RUNTIME_MODULE && m.state == ModuleState::Active);
    if components.is_empty() && !runtime_active {
        sink(NO_COMPONENT_RUNTIME.to_string());
        return;
    }

    sink(COMPONENTS_HEADER.to_string());
    for line in component_report_lines(&components) {
        sink(line);
    }
}

/// 依次输出模块、组件、能力报告
pub async fn print_framework_state(framework: &dyn Framework, sink: &mut dyn FnMut(String)) {
    print_modules(framework, sink).await;
    print_components(framework, sink).await;
    print_capabilities(framework, sink).await;
}

/// 把报告行写入 tracing 日志
pub fn tracing_sink() -> impl FnMut(String) {
    |line: String| info!(target: "chips_testkit::diagnostics", "{}", line)
}

/// 检查运行时无错误
///
/// 收集自创建以来的所有错误事件，以及所有未满足或激活失败的组件。
///
/// # Errors
///
/// 存在任何问题时返回 `AssertionFailed`，列出全部问题
pub async fn assert_error_free(framework: &dyn Framework) -> Result<()> {
    let mut problems: Vec<String> = framework
        .events()
        .await
        .into_iter()
        .filter(|e| e.is_error())
        .map(|e| format!("{}: {}", e.source, e.message))
        .collect();

    let components = framework.components().await;
    for component in components.iter().filter(|c| c.state.is_problem()) {
        match component.state {
            ComponentState::FailedActivation => problems.push(format!(
                "组件 {} 激活失败: {}",
                component.name,
                component.failure.as_deref().unwrap_or("未知原因")
            )),
            ComponentState::UnsatisfiedReference => problems.push(format!(
                "组件 {} 未满足，缺少引用: {}",
                component.name,
                component.unsatisfied_references.join(", ")
            )),
            _ => problems.push(format!("组件 {} 未满足，缺少配置", component.name)),
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::AssertionFailed { problems })
    }
}
