pub mod local;
pub mod remote;

use crate::core::age::Age;
use crate::core::listing::{shell_quote, Listing, Platform};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub use local::LocalChannel;
pub use remote::RemoteChannel;

/// 命令执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// 退出码为 0
    pub success: bool,
}

/// 把命令列表拼成一条 `&&` 链，后面的命令能看到前面命令的副作用
pub fn join_commands(working_dir: Option<&str>, commands: &[String]) -> String {
    let mut parts = Vec::with_capacity(commands.len() + 1);
    if let Some(dir) = working_dir {
        parts.push(format!("cd {}", shell_quote(dir)));
    }
    parts.extend(commands.iter().cloned());
    parts.join(" && ")
}

/// 相对路径按工作目录解析
pub fn resolve_path(working_dir: Option<&str>, path: &str) -> String {
    match working_dir {
        Some(dir) if !path.starts_with('/') => {
            format!("{}/{}", dir.trim_end_matches('/'), path)
        }
        _ => path.to_string(),
    }
}

/// 命令通道：本地 shell 或远程 SSH 会话
///
/// 不同的 `execute` 调用之间不共享工作目录，唯一共享的可变状态是
/// `change_directory` 设置的工作目录覆盖。
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// 执行命令（以 `&&` 连接）
    async fn execute(&self, commands: &[String], strip: bool) -> Result<CommandOutput>;

    /// 上传：本地文件 -> 通道端文件，无条件覆盖
    async fn put(&self, local_path: &str, remote_path: &str) -> Result<()>;

    /// 下载：通道端文件 -> 本地文件，无条件覆盖
    async fn get(&self, remote_path: &str, local_path: &str) -> Result<()>;

    /// 设置工作目录覆盖；`None` 表示回到默认目录
    fn change_directory(&self, dir: Option<String>);

    fn working_directory(&self) -> Option<String>;

    /// 目标系统类型
    async fn platform(&self) -> Result<Platform>;

    /// 释放会话，可重复调用
    async fn close(&self) -> Result<()>;

    /// 名称（用于日志）
    fn name(&self) -> &str;

    fn is_remote(&self) -> bool;

    /// 执行单条命令并返回 stdout
    async fn run(&self, command: &str, strip: bool) -> Result<String> {
        let output = self.execute(&[command.to_string()], strip).await?;
        Ok(output.stdout)
    }

    /// 查询文件年龄，不存在返回 `None`
    async fn age(&self, path: &str) -> Result<Option<Age>> {
        shell::age(self, path).await
    }

    /// 修改文件的最后修改时间
    async fn set_age(&self, path: &str, age: Age) -> Result<()> {
        shell::set_age(self, path, age).await
    }

    /// 递归列出目录；目录不存在时为空
    async fn listing(&self, root: &str) -> Result<Listing> {
        shell::listing(self, root).await
    }

    /// 创建目录（含父目录）
    async fn create_dir(&self, path: &str) -> Result<()> {
        shell::create_dir(self, path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        shell::exists(self, path).await
    }
}

/// 基于 shell 命令的文本协议实现，没有原生接口时使用
pub mod shell {
    use super::*;

    pub async fn age<C: CommandChannel + ?Sized>(ch: &C, path: &str) -> Result<Option<Age>> {
        let platform = ch.platform().await?;
        let output = ch.run(&platform.stat_command(path), true).await?;
        Age::parse_stat(&output)
    }

    pub async fn set_age<C: CommandChannel + ?Sized>(ch: &C, path: &str, age: Age) -> Result<()> {
        let platform = ch.platform().await?;
        ch.run(&platform.touch_command(path, age), true).await?;
        Ok(())
    }

    pub async fn listing<C: CommandChannel + ?Sized>(ch: &C, root: &str) -> Result<Listing> {
        let platform = ch.platform().await?;
        let output = ch.run(&platform.listing_command(root), false).await?;
        Ok(Listing::parse(&output, root))
    }

    pub async fn create_dir<C: CommandChannel + ?Sized>(ch: &C, path: &str) -> Result<()> {
        ch.run(&format!("mkdir -p {}", shell_quote(path)), true)
            .await?;
        Ok(())
    }

    pub async fn exists<C: CommandChannel + ?Sized>(ch: &C, path: &str) -> Result<bool> {
        let output = ch
            .run(&format!("test -e {} && echo 0", shell_quote(path)), true)
            .await?;
        Ok(output == "0")
    }
}

/// SSH 认证方式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 私钥文件路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// 尝试 ssh-agent
    #[serde(default = "default_true")]
    pub use_agent: bool,
    /// 校验 ~/.ssh/known_hosts
    #[serde(default = "default_true")]
    pub check_host_key: bool,
    /// 服务器要求密码 + 验证码（keyboard-interactive）
    #[serde(default)]
    pub two_factor: bool,
    /// 验证码；不配置时由调用方在连接前询问
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twofa_code: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl RemoteConfig {
    /// 解析 `username@hostname`
    pub fn from_login(login: &str) -> Result<Self> {
        let (username, host) = login
            .split_once('@')
            .filter(|(u, h)| !u.is_empty() && !h.is_empty())
            .ok_or_else(|| Error::Config(format!("登录名应为 username@hostname: {}", login)))?;
        Ok(Self {
            host: host.to_string(),
            port: default_port(),
            username: username.to_string(),
            password: None,
            private_key: None,
            passphrase: None,
            use_agent: true,
            check_host_key: true,
            two_factor: false,
            twofa_code: None,
        })
    }

    pub fn target_name(&self) -> String {
        format!("{}--{}", self.username, self.host)
    }
}

/// 通道类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// 回环：“远程”也是本机
    #[default]
    Local,
    Remote(RemoteConfig),
}

/// 根据配置创建通道
pub async fn open_channel(config: &ChannelConfig) -> Result<Arc<dyn CommandChannel>> {
    match config {
        ChannelConfig::Local => {
            tracing::info!("使用本地通道");
            Ok(Arc::new(LocalChannel::new()) as Arc<dyn CommandChannel>)
        }
        ChannelConfig::Remote(remote) => {
            tracing::info!(
                "连接远程主机: {}@{}:{}",
                remote.username,
                remote.host,
                remote.port
            );
            Ok(Arc::new(RemoteChannel::connect(remote.clone()).await?) as Arc<dyn CommandChannel>)
        }
    }
}

/// 打开通道，执行 `f`，无论成功与否都关闭通道
pub async fn with_channel<F, Fut, T>(config: &ChannelConfig, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn CommandChannel>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let channel = open_channel(config).await?;
    let result = f(channel.clone()).await;
    if let Err(e) = channel.close().await {
        tracing::warn!("关闭通道 {} 失败: {}", channel.name(), e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_chained_after_cd() {
        let cmds = vec!["ls".to_string(), "pwd".to_string()];
        assert_eq!(join_commands(None, &cmds), "ls && pwd");
        assert_eq!(
            join_commands(Some("/scratch/my run"), &cmds),
            "cd '/scratch/my run' && ls && pwd"
        );
    }

    #[test]
    fn test_relative_paths_follow_working_directory() {
        assert_eq!(resolve_path(Some("/w/"), "out.txt"), "/w/out.txt");
        assert_eq!(resolve_path(Some("/w"), "/abs.txt"), "/abs.txt");
        assert_eq!(resolve_path(None, "rel.txt"), "rel.txt");
    }

    #[test]
    fn test_login_parsing() {
        let cfg = RemoteConfig::from_login("alice@cluster.example.org").unwrap();
        assert_eq!(cfg.username, "alice");
        assert_eq!(cfg.host, "cluster.example.org");
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.target_name(), "alice--cluster.example.org");
        assert!(RemoteConfig::from_login("nohost").is_err());
        assert!(RemoteConfig::from_login("@host").is_err());
    }

    #[test]
    fn test_channel_config_json_shape() {
        let local: ChannelConfig = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(local, ChannelConfig::Local);

        let remote: ChannelConfig = serde_json::from_str(
            r#"{"type":"remote","host":"h","username":"u","privateKey":"/k"}"#,
        )
        .unwrap();
        match remote {
            ChannelConfig::Remote(r) => {
                assert_eq!(r.port, 22);
                assert_eq!(r.private_key.as_deref(), Some("/k"));
                assert!(r.check_host_key);
                assert!(!r.two_factor);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_two_factor_fields() {
        let remote: RemoteConfig = serde_json::from_str(
            r#"{"host":"h","username":"u","password":"p","twoFactor":true,"twofaCode":"123456"}"#,
        )
        .unwrap();
        assert!(remote.two_factor);
        assert_eq!(remote.twofa_code.as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn test_with_channel_closes_on_error() {
        let result: Result<()> = with_channel(&ChannelConfig::Local, |ch| async move {
            assert!(!ch.is_remote());
            Err(Error::Config("boom".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
