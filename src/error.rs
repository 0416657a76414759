//! 错误类型

use thiserror::Error;

/// 同步与作业监控的统一错误
#[derive(Debug, Error)]
pub enum Error {
    /// 无法建立连接或会话（致命，不重试）
    #[error("连接失败 {target}: {reason}")]
    Connect { target: String, reason: String },

    /// 认证失败
    #[error("SSH 认证失败 {user}@{host}: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    /// 命令的 stderr 非空
    #[error("命令执行出错: {command}\n> {stdout}\n2> {stderr}")]
    RemoteCommand {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// 命令输出格式不符合预期
    #[error("无法解析{context}: {text:?}")]
    Parse { context: &'static str, text: String },

    #[error("不支持的系统: {0}")]
    UnsupportedPlatform(String),

    /// 提交回执中找不到作业编号
    #[error("提交回执中没有作业编号: {0:?}")]
    Submission(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    #[error("后台任务失败: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn parse(context: &'static str, text: impl Into<String>) -> Self {
        Error::Parse {
            context,
            text: text.into(),
        }
    }

    /// 是否为传输层错误（连接、认证或命令 stderr）
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::Auth { .. } | Error::RemoteCommand { .. } | Error::Ssh(_)
        )
    }
}
