//! 集成测试共用的通道与目录工具
#![allow(dead_code)]

use async_trait::async_trait;
use jobsync_lib::channel::{CommandChannel, CommandOutput, LocalChannel};
use jobsync_lib::core::{Age, Listing, Platform};
use jobsync_lib::{Error, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// 写入文件并设置修改时间
pub fn write_aged(root: &Path, rel: &str, contents: &str, secs: i64) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(Age::from_secs(secs).to_system_time()).unwrap();
}

pub fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// 走 shell 文本协议的本地通道，记录所有 put / get
///
/// 可以让第 n 次之后的传输或所有建目录操作失败。
pub struct RecordingChannel {
    inner: LocalChannel,
    pub puts: Mutex<Vec<String>>,
    pub gets: Mutex<Vec<String>>,
    transfers_allowed: Option<usize>,
    fail_create_dir: bool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, false))
    }

    /// 前 `allowed` 次传输成功，之后的传输都失败
    pub fn failing_after(allowed: usize) -> Arc<Self> {
        Arc::new(Self::build(Some(allowed), false))
    }

    pub fn failing_create_dir() -> Arc<Self> {
        Arc::new(Self::build(None, true))
    }

    fn build(transfers_allowed: Option<usize>, fail_create_dir: bool) -> Self {
        Self {
            inner: LocalChannel::textual(),
            puts: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
            transfers_allowed,
            fail_create_dir,
        }
    }

    pub fn transfer_attempts(&self) -> usize {
        self.puts.lock().unwrap().len() + self.gets.lock().unwrap().len()
    }

    fn check_transfer(&self) -> Result<()> {
        match self.transfers_allowed {
            Some(allowed) if self.transfer_attempts() > allowed => Err(Error::Io(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "连接中断"),
            )),
            _ => Ok(()),
        }
    }

    pub fn put_targets(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn get_sources(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn execute(&self, commands: &[String], strip: bool) -> Result<CommandOutput> {
        self.inner.execute(commands, strip).await
    }

    async fn put(&self, local_path: &str, remote_path: &str) -> Result<()> {
        self.puts.lock().unwrap().push(remote_path.to_string());
        self.check_transfer()?;
        self.inner.put(local_path, remote_path).await
    }

    async fn get(&self, remote_path: &str, local_path: &str) -> Result<()> {
        self.gets.lock().unwrap().push(remote_path.to_string());
        self.check_transfer()?;
        self.inner.get(remote_path, local_path).await
    }

    fn change_directory(&self, dir: Option<String>) {
        self.inner.change_directory(dir)
    }

    fn working_directory(&self) -> Option<String> {
        self.inner.working_directory()
    }

    async fn platform(&self) -> Result<Platform> {
        self.inner.platform().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn listing(&self, root: &str) -> Result<Listing> {
        self.inner.listing(root).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        if self.fail_create_dir {
            return Err(Error::RemoteCommand {
                command: format!("mkdir -p {}", path),
                stdout: String::new(),
                stderr: "mkdir: Permission denied".to_string(),
            });
        }
        self.inner.create_dir(path).await
    }
}

/// 依次返回预设的队列输出
pub struct ScriptedQueue {
    replies: Mutex<VecDeque<Result<String>>>,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedQueue {
    pub fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn polls(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

pub fn stderr_reply(text: &str) -> Result<String> {
    Err(Error::RemoteCommand {
        command: "squeue".to_string(),
        stdout: String::new(),
        stderr: text.to_string(),
    })
}

#[async_trait]
impl CommandChannel for ScriptedQueue {
    async fn execute(&self, commands: &[String], _strip: bool) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(commands.join(" && "));
        let next = self.replies.lock().unwrap().pop_front();
        let stdout = next.unwrap_or_else(|| Ok(String::new()))?;
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            success: true,
        })
    }

    async fn put(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    fn change_directory(&self, _: Option<String>) {}

    fn working_directory(&self) -> Option<String> {
        None
    }

    async fn platform(&self) -> Result<Platform> {
        Ok(Platform::Linux)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn is_remote(&self) -> bool {
        true
    }
}
