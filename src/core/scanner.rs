use crate::channel::CommandChannel;
use crate::core::age::Age;
use crate::core::listing::ListingBlock;
use crate::error::Result;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// 扫描得到的一个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// 相对扫描根目录的路径，以 `/` 分隔
    pub relative_path: String,
    pub absolute_path: String,
    pub age: Age,
}

/// 目录树扫描器
///
/// 对源端执行一次递归列表，按排除规则裁剪子树，跳过隐藏文件和目录条目。
pub struct TreeScanner {
    exclude_dirs: BTreeSet<String>,
}

impl TreeScanner {
    pub fn new<I, S>(exclude_dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_dirs: exclude_dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exclude_dirs(&self) -> &BTreeSet<String> {
        &self.exclude_dirs
    }

    /// 相对路径中任一层目录名在排除集合中
    pub fn is_excluded(&self, relative: &str) -> bool {
        relative
            .split('/')
            .filter(|c| !c.is_empty())
            .any(|c| self.exclude_dirs.contains(c))
    }

    /// 只扫描，不创建镜像目录
    pub async fn scan(&self, source: &dyn CommandChannel, root: &str) -> Result<Vec<ScanEntry>> {
        self.walk(source, root, None).await
    }

    /// 扫描源端，同时在目标端创建对应的目录结构
    pub async fn scan_mirrored(
        &self,
        source: &dyn CommandChannel,
        root: &str,
        target: &dyn CommandChannel,
        target_root: &str,
    ) -> Result<Vec<ScanEntry>> {
        self.walk(source, root, Some((target, target_root))).await
    }

    async fn walk(
        &self,
        source: &dyn CommandChannel,
        root: &str,
        mirror: Option<(&dyn CommandChannel, &str)>,
    ) -> Result<Vec<ScanEntry>> {
        info!("开始扫描: {} ({})", root, source.name());
        let listing = source.listing(root).await?;
        let root_norm = normalize(root);

        let mut files = Vec::new();
        let mut pruned = 0usize;

        for block in &listing.blocks {
            let Some(stem) = relative_stem(&root_norm, &block.dir) else {
                warn!("列表块不在扫描根目录下，跳过: {}", block.dir);
                continue;
            };

            if self.is_excluded(stem) {
                debug!("排除目录: {}", block.dir);
                pruned += 1;
                continue;
            }

            if let Some((target, target_root)) = mirror {
                // 空的根目录不在目标端创建任何东西
                if !stem.is_empty() || has_visible_entries(block) {
                    let dir = join(&normalize(target_root), stem);
                    target.create_dir(&dir).await?;
                }
            }

            let dir = normalize(&block.dir);
            for entry in &block.entries {
                if entry.is_hidden() || entry.is_dir() {
                    continue;
                }
                files.push(ScanEntry {
                    relative_path: join(stem, &entry.name),
                    absolute_path: join(&dir, &entry.name),
                    age: Age::from_secs(entry.mtime),
                });
            }
        }

        info!(
            "扫描完成: {} 个文件, {} 个目录被排除, {} 行无法解析",
            files.len(),
            pruned,
            listing.skipped_lines
        );
        Ok(files)
    }
}

impl Default for TreeScanner {
    fn default() -> Self {
        Self {
            exclude_dirs: BTreeSet::new(),
        }
    }
}

fn has_visible_entries(block: &ListingBlock) -> bool {
    block.entries.iter().any(|e| !e.is_hidden())
}

fn normalize(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    path.trim_end_matches('/').to_string()
}

/// 目录相对根目录的部分；不在根目录下时返回 `None`
fn relative_stem<'a>(root: &str, dir: &'a str) -> Option<&'a str> {
    if root == "/" {
        return dir.starts_with('/').then(|| dir.trim_matches('/'));
    }
    let rest = dir.trim_end_matches('/').strip_prefix(root)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(rest.trim_matches('/'))
}

/// 用 `/` 拼接路径，忽略空段
pub(crate) fn join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => rest.to_string(),
        (false, false) if base.ends_with('/') => format!("{}{}", base, rest),
        (false, false) => format!("{}/{}", base, rest),
    }
}
