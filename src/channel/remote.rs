use super::{join_commands, resolve_path, CommandChannel, CommandOutput, RemoteConfig};
use crate::core::age::Age;
use crate::core::listing::Platform;
use crate::error::{Error, Result};
use async_trait::async_trait;
use ssh2::{CheckResult, FileStat, KeyboardInteractivePrompt, KnownHostFileKind, Prompt, Session, Sftp};
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, error, info};

/// SFTP 的“文件不存在”状态码
const SFTP_NO_SUCH_FILE: i32 = 2;

struct SshSession {
    session: Session,
    sftp: Sftp,
}

/// 通过 SSH 执行命令、通过 SFTP 传输文件的远程通道
///
/// libssh2 的调用都是阻塞的，统一放进 `spawn_blocking`。
/// 会话在 `close` 或 `Drop` 时释放。
pub struct RemoteChannel {
    inner: Arc<Mutex<Option<SshSession>>>,
    config: RemoteConfig,
    working_dir: RwLock<Option<String>>,
    platform: OnceLock<Platform>,
    name: String,
}

impl RemoteChannel {
    /// 建立并认证会话；失败是致命的，不重试
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        let cfg = config.clone();
        let ssh = tokio::task::spawn_blocking(move || connect_blocking(&cfg)).await??;

        let name = format!("ssh://{}@{}:{}", config.username, config.host, config.port);
        let channel = Self {
            inner: Arc::new(Mutex::new(Some(ssh))),
            config,
            working_dir: RwLock::new(None),
            platform: OnceLock::new(),
            name,
        };

        let uname = channel.run("uname", true).await?;
        let platform = Platform::from_uname(&uname)?;
        let _ = channel.platform.set(platform);
        info!("已连接远程 {} 系统: {}", uname, channel.name);

        Ok(channel)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn resolve(&self, path: &str) -> String {
        resolve_path(self.working_directory().as_deref(), path)
    }

    /// 在阻塞线程中使用会话
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SshSession) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let target = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(ssh) => f(ssh),
                None => Err(Error::Connect {
                    target,
                    reason: "会话已关闭".to_string(),
                }),
            }
        })
        .await?
    }
}

fn connect_blocking(config: &RemoteConfig) -> Result<SshSession> {
    let addr = format!("{}:{}", config.host, config.port);
    let connect_err = |reason: String| Error::Connect {
        target: addr.clone(),
        reason,
    };

    let tcp = TcpStream::connect(&addr).map_err(|e| connect_err(format!("TCP 连接失败: {}", e)))?;
    let mut session = Session::new().map_err(|e| connect_err(format!("创建 SSH 会话失败: {}", e)))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| connect_err(format!("SSH 握手失败: {}", e)))?;

    if config.check_host_key {
        verify_host_key(&session, config).map_err(connect_err)?;
    }

    authenticate(&session, config)?;

    let sftp = session
        .sftp()
        .map_err(|e| connect_err(format!("创建 SFTP 会话失败: {}", e)))?;

    Ok(SshSession { session, sftp })
}

fn verify_host_key(session: &Session, config: &RemoteConfig) -> Result<(), String> {
    let mut known_hosts = session.known_hosts().map_err(|e| e.to_string())?;
    let file = crate::dirs::home_dir()
        .map(|h| h.join(".ssh").join("known_hosts"))
        .ok_or_else(|| "无法获取 home 目录".to_string())?;
    known_hosts
        .read_file(&file, KnownHostFileKind::OpenSSH)
        .map_err(|e| format!("读取 {} 失败: {}", file.display(), e))?;

    let (key, _) = session
        .host_key()
        .ok_or_else(|| "服务器没有提供主机密钥".to_string())?;
    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(format!("{} 不在 known_hosts 中", config.host)),
        CheckResult::Mismatch => Err(format!("{} 的主机密钥与 known_hosts 不一致", config.host)),
        CheckResult::Failure => Err("主机密钥校验失败".to_string()),
    }
}

/// 密码 + 验证码的 keyboard-interactive 应答
///
/// 每轮只接受一个提示；不认识的提示不作答并记下原因。
struct TwoFactorPrompt<'a> {
    password: Option<&'a str>,
    code: Option<&'a str>,
    error: Option<String>,
}

impl<'a> TwoFactorPrompt<'a> {
    fn new(config: &'a RemoteConfig) -> Self {
        Self {
            password: config.password.as_deref(),
            code: config.twofa_code.as_deref(),
            error: None,
        }
    }

    fn answer(&self, text: &str) -> std::result::Result<String, String> {
        let reply = if text.contains("Password") {
            self.password
        } else if text.contains("Verification") {
            self.code
        } else {
            return Err(format!("意外的提示: {}", text.trim()));
        };
        reply
            .map(str::to_string)
            .ok_or_else(|| format!("没有配置 {} 的应答", text.trim()))
    }
}

impl KeyboardInteractivePrompt for TwoFactorPrompt<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        debug!("keyboard-interactive 提示: {:?}", prompts.iter().map(|p| &p.text).collect::<Vec<_>>());
        match prompts {
            [] => Vec::new(),
            [prompt] => match self.answer(&prompt.text) {
                Ok(reply) => vec![reply],
                Err(e) => {
                    self.error = Some(e);
                    Vec::new()
                }
            },
            _ => {
                self.error = Some(format!("每次只应有一个提示，收到 {} 个", prompts.len()));
                Vec::new()
            }
        }
    }
}

/// 依次尝试私钥、密码（双因素时走 keyboard-interactive）、agent
fn authenticate(session: &Session, config: &RemoteConfig) -> Result<()> {
    let mut auth_errs: Vec<String> = Vec::new();

    if let Some(key) = &config.private_key {
        if let Err(e) = session.userauth_pubkey_file(
            &config.username,
            None,
            Path::new(key),
            config.passphrase.as_deref(),
        ) {
            auth_errs.push(format!("pubkey: {}", e));
        }
    }
    if !session.authenticated() && config.two_factor {
        let mut prompter = TwoFactorPrompt::new(config);
        if let Err(e) = session.userauth_keyboard_interactive(&config.username, &mut prompter) {
            let reason = prompter.error.take().unwrap_or_else(|| e.to_string());
            auth_errs.push(format!("keyboard-interactive: {}", reason));
        }
    } else if !session.authenticated() {
        if let Some(password) = &config.password {
            if let Err(e) = session.userauth_password(&config.username, password) {
                auth_errs.push(format!("password: {}", e));
            }
        }
    }
    if !session.authenticated() && config.use_agent {
        if let Err(e) = session.userauth_agent(&config.username) {
            auth_errs.push(format!("agent: {}", e));
        }
    }

    if !session.authenticated() {
        debug!("SSH 认证失败: {}", auth_errs.join("; "));
        return Err(Error::Auth {
            user: config.username.clone(),
            host: config.host.clone(),
            reason: if auth_errs.is_empty() {
                "没有可用的认证方式".to_string()
            } else {
                auth_errs.join("; ")
            },
        });
    }
    Ok(())
}

fn exec_blocking(session: &Session, command: &str) -> Result<(String, String, i32)> {
    let channel = session.channel_session()?;
    // 所有路径上都关闭 exec 通道
    let mut channel = scopeguard::guard(channel, |mut ch| {
        let _ = ch.close();
        let _ = ch.wait_close();
    });

    channel.exec(command)?;
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;
    channel.wait_close()?;
    let status = channel.exit_status()?;

    Ok((stdout, stderr, status))
}

fn sftp_not_found(e: &ssh2::Error) -> bool {
    matches!(e.code(), ssh2::ErrorCode::SFTP(code) if code == SFTP_NO_SUCH_FILE)
}

#[async_trait]
impl CommandChannel for RemoteChannel {
    async fn execute(&self, commands: &[String], strip: bool) -> Result<CommandOutput> {
        let command = join_commands(self.working_directory().as_deref(), commands);
        debug!("< {}", command);

        let cmd = command.clone();
        let (mut stdout, stderr, status) = self
            .with_session(move |ssh| exec_blocking(&ssh.session, &cmd))
            .await?;
        if strip {
            stdout = stdout.trim().to_string();
        }

        if !stderr.is_empty() {
            error!("远程命令出错\n< {}\n> {}\n2> {}", command, stdout, stderr);
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
            success: status == 0,
        })
    }

    async fn put(&self, local_path: &str, remote_path: &str) -> Result<()> {
        let remote = self.resolve(remote_path);
        debug!("put: {} -> [remote]{}", local_path, remote);
        let local = PathBuf::from(local_path);
        self.with_session(move |ssh| {
            let mut src = std::fs::File::open(&local)?;
            let mut dst = ssh.sftp.create(Path::new(&remote))?;
            std::io::copy(&mut src, &mut dst)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, remote_path: &str, local_path: &str) -> Result<()> {
        let remote = self.resolve(remote_path);
        debug!("get: [remote]{} -> {}", remote, local_path);
        let local = PathBuf::from(local_path);
        self.with_session(move |ssh| {
            let mut src = ssh.sftp.open(Path::new(&remote))?;
            let file_name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let temp = local.with_file_name(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));
            let copied = std::fs::File::create(&temp)
                .and_then(|mut dst| std::io::copy(&mut src, &mut dst))
                .and_then(|_| std::fs::rename(&temp, &local));
            if let Err(e) = copied {
                let _ = std::fs::remove_file(&temp);
                return Err(e.into());
            }
            Ok(())
        })
        .await
    }

    fn change_directory(&self, dir: Option<String>) {
        let mut guard = self.working_dir.write().unwrap_or_else(|e| e.into_inner());
        debug!("远程工作目录: {:?}", dir);
        *guard = dir;
    }

    fn working_directory(&self) -> Option<String> {
        self.working_dir
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn platform(&self) -> Result<Platform> {
        if let Some(p) = self.platform.get() {
            return Ok(*p);
        }
        let uname = self.run("uname", true).await?;
        let platform = Platform::from_uname(&uname)?;
        Ok(*self.platform.get_or_init(|| platform))
    }

    async fn close(&self) -> Result<()> {
        let inner = self.inner.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let taken = inner.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(ssh) = taken {
                drop(ssh.sftp);
                ssh.session.disconnect(None, "closing", None)?;
                info!("已断开: {}", name);
            }
            Ok(())
        })
        .await?
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        true
    }

    /// 通过 SFTP stat 查询，避免依赖 stat 命令的输出格式
    async fn age(&self, path: &str) -> Result<Option<Age>> {
        let path = self.resolve(path);
        self.with_session(move |ssh| match ssh.sftp.stat(Path::new(&path)) {
            Ok(stat) if stat.is_file() => Ok(stat.mtime.map(|m| Age::from_secs(m as i64))),
            Ok(_) => Ok(None),
            Err(e) if sftp_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn set_age(&self, path: &str, age: Age) -> Result<()> {
        let path = self.resolve(path);
        let secs = age.secs().max(0) as u64;
        self.with_session(move |ssh| {
            ssh.sftp.setstat(
                Path::new(&path),
                FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: None,
                    atime: Some(secs),
                    mtime: Some(secs),
                },
            )?;
            Ok(())
        })
        .await
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        let taken = self
            .inner
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None);
        if let Some(ssh) = taken {
            debug!("通道未显式关闭，断开: {}", self.name);
            drop(ssh.sftp);
            let _ = ssh.session.disconnect(None, "closing", None);
        }
    }
}
