use super::{join_commands, resolve_path, shell, CommandChannel, CommandOutput};
use crate::core::age::Age;
use crate::core::listing::{Listing, ListingBlock, ListingEntry, Platform};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// 本地 shell 通道
///
/// 默认使用原生文件系统接口（walkdir / metadata）代替 `ls` 和 `stat`，
/// `textual()` 构造的实例走与远程相同的文本协议。
pub struct LocalChannel {
    working_dir: RwLock<Option<String>>,
    native: bool,
    name: String,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self {
            working_dir: RwLock::new(None),
            native: true,
            name: "local".to_string(),
        }
    }

    /// 使用 shell 文本协议的本地通道
    pub fn textual() -> Self {
        Self {
            working_dir: RwLock::new(None),
            native: false,
            name: "local(shell)".to_string(),
        }
    }

    fn resolve(&self, path: &str) -> String {
        resolve_path(self.working_directory().as_deref(), path)
    }

    /// 先写入同目录下的临时文件，再原子重命名
    async fn copy_file(from: &str, to: &str) -> Result<()> {
        let target = PathBuf::from(to);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        if let Err(e) = fs::copy(from, &temp).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn execute(&self, commands: &[String], strip: bool) -> Result<CommandOutput> {
        let command = join_commands(self.working_directory().as_deref(), commands);
        debug!("< {}", command);

        let output = Command::new("sh").arg("-c").arg(&command).output().await?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if strip {
            stdout = stdout.trim().to_string();
        }

        if !stderr.trim().is_empty() {
            error!("命令执行出错\n< {}\n> {}\n2> {}", command, stdout, stderr);
            return Err(Error::RemoteCommand {
                command,
                stdout,
                stderr,
            });
        }

        debug!("> {}", stdout);
        Ok(CommandOutput {
            stdout,
            stderr,
            success: output.status.success(),
        })
    }

    async fn put(&self, local_path: &str, remote_path: &str) -> Result<()> {
        let remote_path = self.resolve(remote_path);
        debug!("put: {} -> {}", local_path, remote_path);
        Self::copy_file(local_path, &remote_path).await
    }

    async fn get(&self, remote_path: &str, local_path: &str) -> Result<()> {
        let remote_path = self.resolve(remote_path);
        debug!("get: {} -> {}", remote_path, local_path);
        Self::copy_file(&remote_path, local_path).await
    }

    fn change_directory(&self, dir: Option<String>) {
        let mut guard = self.working_dir.write().unwrap_or_else(|e| e.into_inner());
        *guard = dir;
    }

    fn working_directory(&self) -> Option<String> {
        self.working_dir
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn platform(&self) -> Result<Platform> {
        Platform::current()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn age(&self, path: &str) -> Result<Option<Age>> {
        if !self.native {
            return shell::age(self, path).await;
        }
        match fs::metadata(self.resolve(path)).await {
            Ok(meta) if meta.is_file() => Ok(Some(Age::from_system_time(meta.modified()?))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_age(&self, path: &str, age: Age) -> Result<()> {
        if !self.native {
            return shell::set_age(self, path, age).await;
        }
        let path = self.resolve(path);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::options().write(true).open(&path)?;
            file.set_modified(age.to_system_time())
        })
        .await??;
        Ok(())
    }

    async fn listing(&self, root: &str) -> Result<Listing> {
        if !self.native {
            return shell::listing(self, root).await;
        }
        let root = PathBuf::from(self.resolve(root));
        // 使用 spawn_blocking 避免阻塞 async runtime
        let listing = tokio::task::spawn_blocking(move || native_listing(&root)).await??;
        Ok(listing)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        if !self.native {
            return shell::create_dir(self, path).await;
        }
        fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        if !self.native {
            return shell::exists(self, path).await;
        }
        Ok(fs::try_exists(self.resolve(path)).await?)
    }
}

/// 用 walkdir 生成与 `ls -lR` 相同结构的列表
fn native_listing(root: &Path) -> std::io::Result<Listing> {
    let mut listing = Listing::default();
    if !root.is_dir() {
        return Ok(listing);
    }

    // ls -lR 不带 -a：隐藏目录不展开，隐藏文件不列出
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()));
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("遍历目录失败: {}", e);
                listing.skipped_lines += 1;
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let mut children: Vec<_> = std::fs::read_dir(entry.path())?
            .filter_map(|c| c.ok())
            .filter(|c| !is_hidden(&c.file_name().to_string_lossy()))
            .collect();
        children.sort_by_key(|c| c.file_name());

        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let meta = match child.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("读取元数据失败 {:?}: {}", child.path(), e);
                    listing.skipped_lines += 1;
                    continue;
                }
            };
            let file_type = meta.file_type();
            let perms = if file_type.is_dir() {
                "d"
            } else if file_type.is_symlink() {
                "l"
            } else {
                "-"
            };
            let mtime = meta
                .modified()
                .map(|t| Age::from_system_time(t).secs())
                .unwrap_or(0);
            entries.push(ListingEntry {
                perms: perms.to_string(),
                mtime,
                name: child.file_name().to_string_lossy().into_owned(),
            });
        }

        listing.blocks.push(ListingBlock {
            dir: entry.path().to_string_lossy().into_owned(),
            entries,
        });
    }

    Ok(listing)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
