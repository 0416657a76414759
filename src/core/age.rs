//! 文件年龄（最后修改时间，Unix 秒）

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 最后修改时间，唯一的新旧判断依据
///
/// 不存在的文件的年龄是 [`Age::MISSING`]，比任何真实时间都旧。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Age(i64);

impl Age {
    pub const MISSING: Age = Age(i64::MIN);

    pub fn from_secs(secs: i64) -> Self {
        Age(secs)
    }

    pub fn now() -> Self {
        Age(chrono::Utc::now().timestamp())
    }

    pub fn secs(self) -> i64 {
        self.0
    }

    pub fn is_missing(self) -> bool {
        self == Age::MISSING
    }

    /// 解析 stat 输出；空输出表示文件不存在
    pub fn parse_stat(output: &str) -> Result<Option<Self>> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<i64>()
            .map(|secs| Some(Age(secs)))
            .map_err(|_| Error::parse("stat 输出", trimmed))
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Age(d.as_secs() as i64),
            Err(e) => Age(-(e.duration().as_secs() as i64)),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.0.unsigned_abs())
        }
    }

    /// 读取本地文件的年龄；不存在时返回 `MISSING`
    pub fn of_local(path: &Path) -> Self {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(Self::from_system_time)
            .unwrap_or(Age::MISSING)
    }
}

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_missing() {
            return write!(f, "(missing)");
        }
        match chrono::DateTime::from_timestamp(self.0, 0) {
            Some(dt) => write!(
                f,
                "{}",
                dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            ),
            None => write!(f, "@{}", self.0),
        }
    }
}
