//! 日志模块 - 文件日志（按大小轮转）与控制台输出

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "jobsync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，默认为配置目录下的 logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self, config_dir: &Path) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| config_dir.join("logs"))
    }
}

/// 超过大小限制时把当前文件改名为 `.old` 并重新打开
pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    written: u64,
    file: File,
}

impl RotatingFile {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(LOG_FILE);
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;
        Self::with_limit(path, max_size)
    }

    fn with_limit(path: PathBuf, max_size: u64) -> io::Result<Self> {
        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            rotate(&path)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_size,
            written,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// jobsync.log -> jobsync.log.old
fn rotate(path: &Path) -> io::Result<()> {
    let backup = path.with_extension("log.old");
    if backup.exists() {
        fs::remove_file(&backup)?;
    }
    fs::rename(path, &backup)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.file.flush()?;
            rotate(&self.path)?;
            self.file = open_append(&self.path)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// 初始化全局日志
///
/// 返回的 guard 必须在程序结束前一直持有，否则后台线程中缓冲的日志会丢失。
pub fn init(config: &LogConfig, log_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer())
            .try_init();
        return None;
    }

    match RotatingFile::new(log_dir, config.max_size_mb) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            // debug 构建同时输出到控制台
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(cfg!(debug_assertions).then(console_layer))
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer())
                .try_init();
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
            None
        }
    }
}

fn console_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "DEBUG".into();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "nonsense".into();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_rotation_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        let mut file = RotatingFile::with_limit(path.clone(), 16).unwrap();

        file.write_all(b"0123456789\n").unwrap();
        file.write_all(b"abcdefghij\n").unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "abcdefghij\n");
        assert_eq!(
            fs::read_to_string(path.with_extension("log.old")).unwrap(),
            "0123456789\n"
        );
    }

    #[test]
    fn test_init_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            max_size_mb: 1,
            ..Default::default()
        };

        let guard = init(&config, dir.path());
        assert!(guard.is_some());
        tracing::info!("日志初始化完成");
        drop(guard);
        assert!(dir.path().join(LOG_FILE).exists());

        // 已初始化时再次调用不会 panic
        let disabled = LogConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(init(&disabled, dir.path()).is_none());
    }

    #[test]
    fn test_oversized_file_rotates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        fs::write(&path, vec![b'x'; 64]).unwrap();

        let file = RotatingFile::with_limit(path.clone(), 32).unwrap();
        assert_eq!(file.path(), path.as_path());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(path.with_extension("log.old").exists());
    }
}
