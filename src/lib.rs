pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use channel::{
    open_channel, with_channel, ChannelConfig, CommandChannel, LocalChannel, RemoteChannel,
    RemoteConfig,
};
pub use config::{AppConfig, Task};
pub use crate::core::{JobMonitor, JobStatus, MonitorPolicy, SyncConfig, SyncEngine, SyncReport};
pub use error::{Error, Result};

pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(PathBuf::from)
    }

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "macos") {
            home_dir().map(|h| h.join("Library").join("Application Support"))
        } else {
            std::env::var_os("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".config")))
        }
    }
}
