//! 文本协议：stat / ls 命令格式与递归列表解析
//!
//! 远程端没有原生列表接口时，通过 `ls -lR` 的输出获取目录树。
//! 时间列必须显式使用 Unix 秒格式，默认格式依赖 locale 和系统。

use crate::core::age::Age;
use crate::error::{Error, Result};
use tracing::warn;

/// 目标系统类型（决定 ls / stat / touch 的参数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Darwin,
}

impl Platform {
    /// 根据 `uname` 输出判断
    pub fn from_uname(uname: &str) -> Result<Self> {
        match uname.trim() {
            "Linux" => Ok(Platform::Linux),
            "Darwin" => Ok(Platform::Darwin),
            other => Err(Error::UnsupportedPlatform(other.to_string())),
        }
    }

    /// 本机平台
    pub fn current() -> Result<Self> {
        if cfg!(target_os = "linux") {
            Ok(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Ok(Platform::Darwin)
        } else {
            Err(Error::UnsupportedPlatform(std::env::consts::OS.to_string()))
        }
    }

    /// 单文件最后修改时间；文件不存在时输出为空
    pub fn stat_command(self, path: &str) -> String {
        let p = shell_quote(path);
        match self {
            Platform::Linux => format!("test -f {p} && stat -c %Y {p}"),
            Platform::Darwin => format!("test -f {p} && stat -f %m {p}"),
        }
    }

    /// 递归长列表；目录不存在时输出为空
    pub fn listing_command(self, root: &str) -> String {
        let r = shell_quote(root);
        match self {
            Platform::Linux => format!("test -d {r} && ls -lR --time-style=+%s {r}"),
            Platform::Darwin => format!("test -d {r} && ls -lR -D %s {r}"),
        }
    }

    /// 设置文件的最后修改时间
    pub fn touch_command(self, path: &str, age: Age) -> String {
        let p = shell_quote(path);
        match self {
            Platform::Linux => format!("touch -m -d @{} {p}", age.secs()),
            Platform::Darwin => {
                let stamp = chrono::DateTime::from_timestamp(age.secs(), 0)
                    .map(|dt| {
                        dt.with_timezone(&chrono::Local)
                            .format("%Y%m%d%H%M.%S")
                            .to_string()
                    })
                    .unwrap_or_default();
                format!("touch -m -t {stamp} {p}")
            }
        }
    }
}

/// 单引号包裹，供 sh 使用
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// 列表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub perms: String,
    pub mtime: i64,
    pub name: String,
}

impl ListingEntry {
    pub fn is_dir(&self) -> bool {
        self.perms.starts_with('d')
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// 以目录路径为标题的一个块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingBlock {
    pub dir: String,
    pub entries: Vec<ListingEntry>,
}

/// 递归列表结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub blocks: Vec<ListingBlock>,
    /// 无法解析而被跳过的行数
    pub skipped_lines: usize,
}

impl Listing {
    /// 解析 `ls -lR` 输出
    ///
    /// 块之间以空行分隔，块的第一行若以 `:` 结尾则为目录标题。
    /// 没有标题的第一个块属于 `root`。
    pub fn parse(output: &str, root: &str) -> Self {
        let mut listing = Listing::default();
        let mut current: Option<ListingBlock> = None;
        let mut block_start = true;

        for raw in output.lines() {
            let line = raw.trim();
            if line.is_empty() {
                if let Some(block) = current.take() {
                    listing.blocks.push(block);
                }
                block_start = true;
                continue;
            }

            if block_start && line.ends_with(':') {
                if let Some(block) = current.take() {
                    listing.blocks.push(block);
                }
                current = Some(ListingBlock {
                    dir: line.trim_end_matches(':').to_string(),
                    entries: Vec::new(),
                });
                block_start = false;
                continue;
            }
            block_start = false;

            if line.starts_with("total ") {
                continue;
            }

            match parse_entry(line) {
                Some(entry) => current
                    .get_or_insert_with(|| ListingBlock {
                        dir: root.to_string(),
                        entries: Vec::new(),
                    })
                    .entries
                    .push(entry),
                None => {
                    warn!("跳过无法解析的列表行: {}", line);
                    listing.skipped_lines += 1;
                }
            }
        }

        if let Some(block) = current {
            listing.blocks.push(block);
        }
        listing
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.entries.is_empty())
    }

    pub fn file_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.entries)
            .filter(|e| !e.is_dir())
            .count()
    }
}

/// `perms links owner group size mtime name`，文件名可以包含空格
fn parse_entry(line: &str) -> Option<ListingEntry> {
    let fields = split_fields(line, 7);
    if fields.len() < 7 {
        return None;
    }
    let mtime = fields[5].parse::<i64>().ok()?;
    let perms = fields[0].to_string();
    let mut name = fields[6];
    if perms.starts_with('l') {
        name = name.split(" -> ").next().unwrap_or(name);
    }
    Some(ListingEntry {
        perms,
        mtime,
        name: name.to_string(),
    })
}

/// 按空白切分为最多 `n` 段，最后一段保留剩余内容
fn split_fields(line: &str, n: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() + 1 < n {
        match rest.find(char::is_whitespace) {
            Some(i) => {
                fields.push(&rest[..i]);
                rest = rest[i..].trim_start();
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        fields.push(rest);
    }
    fields
}
