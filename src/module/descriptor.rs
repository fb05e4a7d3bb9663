//! 需求描述模型
//!
//! 定义从声明中解析出的模块需求、运行时属性需求、导出包需求以及安装计划。
//! 这些类型在计划解析时创建，之后保持不变。

use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::utils::{HarnessError, Result};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

fn attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*([A-Za-z0-9_.\-]+)\s*:?=\s*"?([^"]*)"?\s*$"#).expect("valid regex")
    })
}

/// 解析版本范围
///
/// 除 semver 语法（`^1.2`、`>=1.0, <2.0`）外，还接受区间写法：
/// `[1.0.0, 2.0.0)` 表示 `>=1.0.0, <2.0.0`，方括号含端点、圆括号不含。
pub fn parse_version_range(raw: &str) -> std::result::Result<VersionReq, semver::Error> {
    let raw = raw.trim();
    let interval = raw
        .strip_prefix(['[', '('])
        .and_then(|rest| rest.strip_suffix([']', ')']))
        .and_then(|body| body.split_once(','));
    let Some((low, high)) = interval else {
        return VersionReq::parse(raw);
    };

    let low_op = if raw.starts_with('[') { ">=" } else { ">" };
    let high_op = if raw.ends_with(']') { "<=" } else { "<" };
    let (low, high) = (low.trim(), high.trim());
    let req = match (low.is_empty(), high.is_empty()) {
        (false, false) => format!("{}{}, {}{}", low_op, low, high_op, high),
        (false, true) => format!("{}{}", low_op, low),
        (true, false) => format!("{}{}", high_op, high),
        (true, true) => "*".to_string(),
    };
    VersionReq::parse(&req)
}

/// 模块标识
///
/// 语法：`name`、`name;version="^1.2"` 或 `name;version="[1.0.0, 2.0.0)"`，其余 `;key=value` 属性原样保留、不参与匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// 模块名
    pub name: String,
    /// 版本范围
    pub version: Option<VersionReq>,
    /// 其它属性
    pub attributes: Vec<(String, String)>,
}

impl ModuleIdentity {
    /// 解析标识字符串
    ///
    /// # Errors
    ///
    /// 名称为空或非法、属性格式错误、版本范围无法解析时返回 `Declaration` 错误
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(declaration(raw, "模块名不能为空"));
        }
        if !name_pattern().is_match(name) {
            return Err(declaration(raw, format!("模块名 '{}' 含有非法字符", name)));
        }

        let mut version = None;
        let mut attributes = Vec::new();
        for part in parts.filter(|p| !p.trim().is_empty()) {
            let captures = attribute_pattern()
                .captures(part)
                .ok_or_else(|| declaration(raw, format!("无法解析属性 '{}'", part.trim())))?;
            let key = captures[1].to_string();
            let value = captures[2].trim().to_string();
            if key == "version" {
                let req = parse_version_range(&value)
                    .map_err(|e| declaration(raw, format!("版本范围 '{}' 无效: {}", value, e)))?;
                version = Some(req);
            } else {
                attributes.push((key, value));
            }
        }

        Ok(Self {
            name: name.to_string(),
            version,
            attributes,
        })
    }

    /// 检查候选模块是否满足此标识
    pub fn matches(&self, name: &str, version: &Version) -> bool {
        self.name == name
            && self
                .version
                .as_ref()
                .map(|req| req.matches(version))
                .unwrap_or(true)
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(ref req) = self.version {
            write!(f, ";version=\"{}\"", req)?;
        }
        Ok(())
    }
}

fn declaration(identity: &str, reason: impl Into<String>) -> HarnessError {
    HarnessError::Declaration {
        identity: identity.to_string(),
        reason: reason.into(),
    }
}

/// 模块需求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequirement {
    /// 原始标识字符串（安装时才解析）
    pub identity: String,

    /// 是否在安装后启动
    #[serde(default)]
    pub start: bool,

    /// 是否安装到隔离组
    #[serde(default)]
    pub isolated: bool,

    /// 隔离组名；隔离需求未指定时以模块名为组名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ModuleRequirement {
    /// 创建只安装、不启动的默认组需求
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            start: false,
            isolated: false,
            group: None,
        }
    }

    /// 安装后启动
    pub fn started(mut self) -> Self {
        self.start = true;
        self
    }

    /// 安装到以模块名命名的隔离组
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// 安装到指定隔离组
    pub fn isolated_in(mut self, group: impl Into<String>) -> Self {
        self.isolated = true;
        self.group = Some(group.into());
        self
    }

    /// 解析标识
    pub fn parse_identity(&self) -> Result<ModuleIdentity> {
        ModuleIdentity::parse(&self.identity)
    }

    /// 所属隔离组，默认组返回 `None`
    pub fn group_name(&self) -> Option<String> {
        if !self.isolated {
            return None;
        }
        match self.group {
            Some(ref group) => Some(group.clone()),
            None => Some(
                self.identity
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            ),
        }
    }

    /// 去重键：标识 + 隔离标志 + 隔离组
    pub(crate) fn dedup_key(&self) -> (String, bool, Option<String>) {
        (self.identity.trim().to_string(), self.isolated, self.group_name())
    }
}

/// 运行时属性需求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRequirement {
    /// 属性名
    pub key: String,
    /// 属性值
    pub value: String,
}

impl PropertyRequirement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 导出包需求
///
/// 包规格字符串，例如 `my.extra.package;version="1.0.0"`，追加到测试探针模块的导出列表。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportRequirement {
    pub spec: String,
}

impl ExportRequirement {
    pub fn new(spec: impl Into<String>) -> Self {
        Self { spec: spec.into() }
    }

    /// 包名（去掉属性部分）
    pub fn package_name(&self) -> &str {
        self.spec.split(';').next().unwrap_or_default().trim()
    }
}

/// 隔离组
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationGroup {
    /// 组名
    pub name: String,
    /// 组内模块（按安装顺序）
    pub modules: Vec<ModuleRequirement>,
}

/// 安装计划
///
/// 分为默认组和零个或多个隔离组。组内顺序即声明顺序（已去重），
/// 隔离组按首次出现的顺序排列。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationPlan {
    /// 默认组
    pub default_group: Vec<ModuleRequirement>,
    /// 隔离组
    pub isolation_groups: Vec<IsolationGroup>,
}

impl InstallationPlan {
    /// 创建空计划
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加需求，返回是否实际加入（重复需求保留首次出现的那个）
    pub fn push(&mut self, requirement: ModuleRequirement) -> bool {
        let key = requirement.dedup_key();
        if self.iter().any(|existing| existing.dedup_key() == key) {
            return false;
        }

        match requirement.group_name() {
            None => self.default_group.push(requirement),
            Some(group) => {
                match self.isolation_groups.iter_mut().find(|g| g.name == group) {
                    Some(existing) => existing.modules.push(requirement),
                    None => self.isolation_groups.push(IsolationGroup {
                        name: group,
                        modules: vec![requirement],
                    }),
                }
            }
        }
        true
    }

    /// 按安装顺序遍历全部需求（默认组在前）
    pub fn iter(&self) -> impl Iterator<Item = &ModuleRequirement> {
        self.default_group
            .iter()
            .chain(self.isolation_groups.iter().flat_map(|g| g.modules.iter()))
    }

    /// 查找隔离组
    pub fn group(&self, name: &str) -> Option<&IsolationGroup> {
        self.isolation_groups.iter().find(|g| g.name == name)
    }

    /// 需求总数
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.default_group.is_empty() && self.isolation_groups.is_empty()
    }
}

/// 将属性需求折叠为最终属性表，同名属性后者覆盖前者
pub fn collapse_properties(properties: &[PropertyRequirement]) -> BTreeMap<String, String> {
    properties
        .iter()
        .map(|p| (p.key.clone(), p.value.clone()))
        .collect()
}
