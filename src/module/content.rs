//! 模块内容
//!
//! 在搜索路径上按模块标识定位模块内容，并以统一的条目视图暴露给运行时：
//! - 目录：`<root>/<name>/module.yaml`
//! - 归档：`<root>/<name>.tar` 或 `<root>/<name>-<version>.tar`
//! - 归档根：搜索路径本身是 .tar，模块位于其中的 `<name>/` 前缀下
//!
//! 归档条目在建立索引时记录数据偏移与长度，打开条目时直接从归档文件定位读取，
//! 不解压、不复制。

use chrono::{DateTime, TimeZone, Utc};
use semver::Version;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use super::descriptor::ModuleIdentity;
use super::metadata::{ModuleManifest, MANIFEST_FILENAME};
use crate::core::HarnessConfig;
use crate::utils::{HarnessError, Result};

/// 内容条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// 相对内容根的路径（`/` 分隔）
    pub name: String,
    /// 字节数
    pub size: u64,
    /// 最后修改时间
    pub last_modified: DateTime<Utc>,
}

/// 模块内容
pub trait ModuleContent: Send + Sync + fmt::Debug {
    /// 内容来源描述
    fn origin(&self) -> &str;

    /// 全部条目（按名称排序）
    fn entries(&self) -> Vec<ContentEntry>;

    /// 查找条目
    fn entry(&self, name: &str) -> Option<ContentEntry>;

    /// 打开条目，每次调用返回一个新的读取流
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// 读取条目为字符串
    fn read_to_string(&self, name: &str) -> Result<String> {
        let mut content = String::new();
        self.open(name)?.read_to_string(&mut content)?;
        Ok(content)
    }

    /// 读取并解析模块清单
    fn manifest(&self) -> Result<ModuleManifest> {
        ModuleManifest::parse(&self.read_to_string(MANIFEST_FILENAME)?)
    }
}

fn entry_not_found(origin: &str, entry: &str) -> HarnessError {
    HarnessError::EntryNotFound {
        origin: origin.to_string(),
        entry: entry.to_string(),
    }
}

// ==================== 目录内容 ====================

/// 目录形式的模块内容
#[derive(Debug)]
pub struct DirectoryContent {
    root: PathBuf,
    origin: String,
    entries: BTreeMap<String, ContentEntry>,
}

impl DirectoryContent {
    /// 遍历目录建立条目索引
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut entries = BTreeMap::new();
        walk_directory(&root, &root, &mut entries)?;
        Ok(Self {
            origin: root.display().to_string(),
            root,
            entries,
        })
    }

    /// 内容根目录
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// 以 `/` 连接的条目名，只保留普通路径段（忽略 `./` 前缀）
fn entry_name(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_directory(
    root: &Path,
    dir: &Path,
    entries: &mut BTreeMap<String, ContentEntry>,
) -> Result<()> {
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let metadata = item.metadata()?;
        if metadata.is_dir() {
            walk_directory(root, &path, entries)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = entry_name(relative);
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        entries.insert(
            name.clone(),
            ContentEntry {
                name,
                size: metadata.len(),
                last_modified,
            },
        );
    }
    Ok(())
}

impl ModuleContent for DirectoryContent {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn entries(&self) -> Vec<ContentEntry> {
        self.entries.values().cloned().collect()
    }

    fn entry(&self, name: &str) -> Option<ContentEntry> {
        self.entries.get(name).cloned()
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        if !self.entries.contains_key(name) {
            return Err(entry_not_found(&self.origin, name));
        }
        let file = File::open(self.root.join(name))?;
        Ok(Box::new(file))
    }
}

// ==================== 归档内容 ====================

#[derive(Debug, Clone)]
struct ArchiveEntry {
    entry: ContentEntry,
    offset: u64,
}

/// 归档（.tar）形式的模块内容
#[derive(Debug)]
pub struct ArchiveContent {
    archive: PathBuf,
    origin: String,
    entries: BTreeMap<String, ArchiveEntry>,
}

impl ArchiveContent {
    /// 以整个归档为内容根
    pub fn open(archive: impl Into<PathBuf>) -> Result<Self> {
        Self::open_prefixed(archive, "")
    }

    /// 以归档中 `prefix` 下的条目为内容根（`prefix` 为空或以 `/` 结尾）
    pub fn open_prefixed(archive: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let archive = archive.into();
        let mut entries = BTreeMap::new();
        for (name, indexed) in index_archive(&archive)? {
            if let Some(relative) = name.strip_prefix(prefix) {
                if relative.is_empty() {
                    continue;
                }
                let mut indexed = indexed;
                indexed.entry.name = relative.to_string();
                entries.insert(relative.to_string(), indexed);
            }
        }

        let origin = if prefix.is_empty() {
            archive.display().to_string()
        } else {
            format!("{}!/{}", archive.display(), prefix)
        };
        Ok(Self {
            archive,
            origin,
            entries,
        })
    }

    /// 归档文件路径
    pub fn archive(&self) -> &Path {
        &self.archive
    }
}

fn index_archive(path: &Path) -> Result<Vec<(String, ArchiveEntry)>> {
    let mut archive = Archive::new(File::open(path)?);
    let mut indexed = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = entry_name(&entry.path()?);
        if name.is_empty() {
            continue;
        }
        let mtime = entry.header().mtime().unwrap_or(0);
        let last_modified = Utc
            .timestamp_opt(mtime as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        indexed.push((
            name.clone(),
            ArchiveEntry {
                entry: ContentEntry {
                    name,
                    size: entry.size(),
                    last_modified,
                },
                offset: entry.raw_file_position(),
            },
        ));
    }
    Ok(indexed)
}

impl ModuleContent for ArchiveContent {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn entries(&self) -> Vec<ContentEntry> {
        self.entries.values().map(|e| e.entry.clone()).collect()
    }

    fn entry(&self, name: &str) -> Option<ContentEntry> {
        self.entries.get(name).map(|e| e.entry.clone())
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let indexed = self
            .entries
            .get(name)
            .ok_or_else(|| entry_not_found(&self.origin, name))?;
        let mut file = File::open(&self.archive)?;
        file.seek(SeekFrom::Start(indexed.offset))?;
        Ok(Box::new(file.take(indexed.entry.size)))
    }
}

// ==================== 测试探针内容 ====================

/// 测试探针模块的合成内容，只包含一个 module.yaml
#[derive(Debug)]
pub struct ProbeContent {
    origin: String,
    manifest: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl ProbeContent {
    /// 由清单生成探针内容
    pub fn new(manifest: &ModuleManifest) -> Result<Self> {
        Ok(Self {
            origin: format!("probe:{}", manifest.name),
            manifest: manifest.to_yaml()?.into_bytes(),
            created_at: Utc::now(),
        })
    }

    /// 以给定导出包创建探针
    pub fn with_exports(name: &str, exports: Vec<String>) -> Result<Self> {
        let mut manifest = ModuleManifest::new(name, "0.0.0");
        manifest.exports = exports;
        Self::new(&manifest)
    }
}

impl ModuleContent for ProbeContent {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn entries(&self) -> Vec<ContentEntry> {
        self.entry(MANIFEST_FILENAME).into_iter().collect()
    }

    fn entry(&self, name: &str) -> Option<ContentEntry> {
        (name == MANIFEST_FILENAME).then(|| ContentEntry {
            name: MANIFEST_FILENAME.to_string(),
            size: self.manifest.len() as u64,
            last_modified: self.created_at,
        })
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        if name != MANIFEST_FILENAME {
            return Err(entry_not_found(&self.origin, name));
        }
        Ok(Box::new(Cursor::new(self.manifest.clone())))
    }
}

// ==================== 搜索路径 ====================

/// 搜索路径上的模块内容定位器
#[derive(Debug, Clone, Default)]
pub struct ClasspathContentProvider {
    roots: Vec<PathBuf>,
}

impl ClasspathContentProvider {
    /// 使用给定的搜索路径
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// 使用配置中的有效搜索路径
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.effective_search_path())
    }

    /// 搜索路径
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// 定位模块内容，按搜索路径顺序首个满足标识（含版本范围）的内容胜出
    ///
    /// # Errors
    ///
    /// 所有搜索路径均无匹配时返回 `ContentNotFound`，其中列出已搜索的路径
    pub fn locate(&self, identity: &ModuleIdentity) -> Result<Arc<dyn ModuleContent>> {
        let mut searched = Vec::new();

        for root in &self.roots {
            searched.push(root.display().to_string());
            let found = if root.is_dir() {
                self.locate_in_directory(root, identity)
            } else if is_tar(root) && root.is_file() {
                self.locate_in_archive(root, identity)
            } else {
                debug!("搜索路径不存在，跳过: {:?}", root);
                None
            };

            if let Some(content) = found {
                debug!(
                    module = %identity.name,
                    origin = %content.origin(),
                    "已定位模块内容"
                );
                return Ok(content);
            }
        }

        Err(HarnessError::ContentNotFound {
            identity: identity.to_string(),
            searched,
        })
    }

    fn locate_in_directory(
        &self,
        root: &Path,
        identity: &ModuleIdentity,
    ) -> Option<Arc<dyn ModuleContent>> {
        let module_dir = root.join(&identity.name);
        if module_dir.join(MANIFEST_FILENAME).is_file() {
            if let Some((_, content)) = accept(DirectoryContent::open(&module_dir), identity) {
                return Some(content);
            }
        }

        let mut candidates = Vec::new();
        for path in archive_candidates(root, &identity.name) {
            if let Some(candidate) = accept(ArchiveContent::open(&path), identity) {
                candidates.push(candidate);
            }
        }
        // 满足范围的最高版本
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.into_iter().next().map(|(_, content)| content)
    }

    fn locate_in_archive(
        &self,
        archive: &Path,
        identity: &ModuleIdentity,
    ) -> Option<Arc<dyn ModuleContent>> {
        let prefix = format!("{}/", identity.name);
        accept(ArchiveContent::open_prefixed(archive, &prefix), identity).map(|(_, c)| c)
    }
}

fn is_tar(path: &Path) -> bool {
    path.extension().map(|e| e == "tar").unwrap_or(false)
}

/// `<name>.tar` 与 `<name>-<version>.tar`
fn archive_candidates(root: &Path, name: &str) -> Vec<PathBuf> {
    let Ok(items) = std::fs::read_dir(root) else {
        return vec![];
    };
    let exact = format!("{}.tar", name);
    let versioned = format!("{}-", name);

    let mut candidates: Vec<PathBuf> = items
        .filter_map(|item| item.ok())
        .map(|item| item.path())
        .filter(|path| path.is_file() && is_tar(path))
        .filter(|path| {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            file_name == exact
                || file_name
                    .strip_prefix(&versioned)
                    .and_then(|rest| rest.strip_suffix(".tar"))
                    .map(|version| Version::parse(version).is_ok())
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates
}

/// 内容可读、清单可解析且满足标识时接受
fn accept<C: ModuleContent + 'static>(
    content: Result<C>,
    identity: &ModuleIdentity,
) -> Option<(Version, Arc<dyn ModuleContent>)> {
    let content = match content {
        Ok(content) => content,
        Err(e) => {
            warn!(module = %identity.name, "读取模块内容失败: {}", e);
            return None;
        }
    };
    content.entry(MANIFEST_FILENAME)?;
    let manifest = match content.manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(module = %identity.name, origin = %content.origin(), "模块清单无效: {}", e);
            return None;
        }
    };
    let version = manifest.parsed_version().ok()?;
    if !identity.matches(&manifest.name, &version) {
        debug!(
            module = %identity.name,
            origin = %content.origin(),
            version = %version,
            "模块版本不满足要求"
        );
        return None;
    }
    let content: Arc<dyn ModuleContent> = Arc::new(content);
    Some((version, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_yaml(name: &str, version: &str) -> String {
        format!("name: {}\nversion: {}\n", name, version)
    }

    fn create_module_dir(root: &Path, name: &str, version: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest_yaml(name, version)).unwrap();
        std::fs::write(dir.join("lib/data.txt"), "payload").unwrap();
    }

    fn create_tar(path: &Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_directory_content() {
        let temp = TempDir::new().unwrap();
        create_module_dir(temp.path(), "my.api", "1.0.0");

        let content = DirectoryContent::open(temp.path().join("my.api")).unwrap();
        let names: Vec<_> = content.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["lib/data.txt", MANIFEST_FILENAME]);
        assert_eq!(content.entry("lib/data.txt").unwrap().size, 7);
        assert_eq!(content.read_to_string("lib/data.txt").unwrap(), "payload");
        // 重复打开互不影响
        assert_eq!(content.read_to_string("lib/data.txt").unwrap(), "payload");
        assert!(matches!(
            content.open("missing"),
            Err(HarnessError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_archive_content_streams_from_offset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle.tar");
        create_tar(
            &path,
            &[
                ("a/module.yaml", "name: a\nversion: 1.0.0\n"),
                ("a/inner.tar", "nested-archive-bytes"),
                ("b/module.yaml", "name: b\nversion: 2.0.0\n"),
            ],
        );

        let content = ArchiveContent::open_prefixed(&path, "a/").unwrap();
        assert_eq!(content.entries().len(), 2);
        assert_eq!(content.read_to_string("inner.tar").unwrap(), "nested-archive-bytes");
        assert_eq!(content.manifest().unwrap().name, "a");
        assert!(content.origin().ends_with("bundle.tar!/a/"));
        let entry = content.entry("inner.tar").unwrap();
        assert_eq!(entry.last_modified.timestamp(), 1_700_000_000);
    }

    /// 以 `./` 为前缀的条目（`tar -C dir -cf m.tar .` 的产物）
    fn create_dot_prefixed_tar(path: &Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        let mut root = tar::Header::new_ustar();
        root.as_old_mut().name[..2].copy_from_slice(b"./");
        root.set_entry_type(EntryType::Directory);
        root.set_size(0);
        root.set_mode(0o755);
        root.set_cksum();
        builder.append(&root, std::io::empty()).unwrap();

        for (name, data) in files {
            let raw = format!("./{}", name);
            let mut header = tar::Header::new_ustar();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw.as_bytes());
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append(&header, data.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_archive_entries_ignore_current_dir_prefix() {
        let temp = TempDir::new().unwrap();
        create_dot_prefixed_tar(
            &temp.path().join("m.tar"),
            &[("module.yaml", "name: m\nversion: 1.0.0\n"), ("lib/data.txt", "payload")],
        );

        let provider = ClasspathContentProvider::new(vec![temp.path().to_path_buf()]);
        let content = provider.locate(&ModuleIdentity::parse("m").unwrap()).unwrap();
        let names: Vec<_> = content.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["lib/data.txt", MANIFEST_FILENAME]);
        assert_eq!(content.read_to_string("lib/data.txt").unwrap(), "payload");
        assert_eq!(content.manifest().unwrap().name, "m");
    }

    #[test]
    fn test_probe_content() {
        let probe = ProbeContent::with_exports("probe", vec!["my.pkg".into()]).unwrap();
        let manifest = probe.manifest().unwrap();
        assert_eq!(manifest.exports, vec!["my.pkg"]);
        assert_eq!(probe.entries().len(), 1);
        assert!(probe.open("other").is_err());
    }

    #[test]
    fn test_locate_first_root_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        create_module_dir(first.path(), "m", "1.0.0");
        create_module_dir(second.path(), "m", "2.0.0");

        let provider = ClasspathContentProvider::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);

        let any = ModuleIdentity::parse("m").unwrap();
        assert_eq!(provider.locate(&any).unwrap().manifest().unwrap().version, "1.0.0");

        // 版本范围不满足时继续查找
        let v2 = ModuleIdentity::parse("m;version=\"^2\"").unwrap();
        assert_eq!(provider.locate(&v2).unwrap().manifest().unwrap().version, "2.0.0");
    }

    #[test]
    fn test_locate_highest_versioned_archive() {
        let temp = TempDir::new().unwrap();
        create_tar(&temp.path().join("m-1.0.0.tar"), &[("module.yaml", "name: m\nversion: 1.0.0\n")]);
        create_tar(&temp.path().join("m-1.5.0.tar"), &[("module.yaml", "name: m\nversion: 1.5.0\n")]);
        create_tar(&temp.path().join("m-2.0.0.tar"), &[("module.yaml", "name: m\nversion: 2.0.0\n")]);

        let provider = ClasspathContentProvider::new(vec![temp.path().to_path_buf()]);
        let identity = ModuleIdentity::parse("m;version=\"<2\"").unwrap();
        let content = provider.locate(&identity).unwrap();
        assert_eq!(content.manifest().unwrap().version, "1.5.0");
    }

    #[test]
    fn test_locate_inside_archive_root() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("all.tar");
        create_tar(&path, &[("x/module.yaml", "name: x\nversion: 0.3.0\n")]);

        let provider = ClasspathContentProvider::new(vec![path]);
        let content = provider.locate(&ModuleIdentity::parse("x").unwrap()).unwrap();
        assert_eq!(content.manifest().unwrap().name, "x");
    }

    #[test]
    fn test_locate_not_found_lists_searched_roots() {
        let temp = TempDir::new().unwrap();
        let provider = ClasspathContentProvider::new(vec![
            temp.path().to_path_buf(),
            temp.path().join("missing.tar"),
        ]);

        match provider.locate(&ModuleIdentity::parse("nope").unwrap()) {
            Err(HarnessError::ContentNotFound { identity, searched }) => {
                assert_eq!(identity, "nope");
                assert_eq!(searched.len(), 2);
            }
            other => panic!("unexpected result: {:?}", other.map(|c| c.origin().to_string())),
        }
    }
}
