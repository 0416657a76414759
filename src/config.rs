//! 应用配置模块

use crate::channel::ChannelConfig;
use crate::core::engine::SyncConfig;
use crate::core::monitor::MonitorPolicy;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_DIR_ENV: &str = "JOBSYNC_CONFIG_DIR";

/// 要执行的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Task {
    #[serde(rename_all = "camelCase")]
    Pull {
        remote_root: String,
        local_root: String,
    },
    #[serde(rename_all = "camelCase")]
    Push {
        local_root: String,
        remote_root: String,
        #[serde(default)]
        empty_push: bool,
        /// 两侧根目录下共同的子目录
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stem: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Twoway {
        remote_root: String,
        local_root: String,
    },
    /// 监控作业；离开队列后若给出了目录则取回结果
    #[serde(rename_all = "camelCase")]
    Watch {
        job_id: String,
        #[serde(default)]
        remote_root: Option<String>,
        #[serde(default)]
        local_root: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Check { job_id: String },
}

/// `config.json` 的全部内容，每一节都可以省略
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub sync: SyncConfig,
    pub monitor: MonitorPolicy,
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

/// 配置目录：`JOBSYNC_CONFIG_DIR`，否则为系统配置目录下的 `jobsync`
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    crate::dirs::config_dir()
        .map(|p| p.join("jobsync"))
        .unwrap_or_else(|| PathBuf::from(".jobsync"))
}

impl AppConfig {
    /// 读取配置文件；文件不存在时使用默认值
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);
        if !config_file.exists() {
            tracing::debug!("配置文件不存在，使用默认配置: {:?}", config_file);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_file)
            .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", config_file.display()))
    }

    /// 只更新某一节，保留文件中的其他内容
    pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        if !config.is_object() {
            config = serde_json::json!({});
        }

        config[key] = serde_json::to_value(value)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("写入配置文件失败: {}", config_file.display()))?;
        Ok(())
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        Self::save_section(config_dir, "channel", &self.channel)?;
        Self::save_section(config_dir, "sync", &self.sync)?;
        Self::save_section(config_dir, "monitor", &self.monitor)?;
        Self::save_section(config_dir, "log", &self.log)?;
        if let Some(task) = &self.task {
            Self::save_section(config_dir, "task", task)?;
        }
        Ok(())
    }
}
