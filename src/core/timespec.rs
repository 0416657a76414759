//! 时间语法
//!
//! ```text
//! <hms>   = <n> | <n>:<n> | <n>:<n>:<n>      s | m:s | h:m:s
//! <input> = <hms> | <n>-<hms>                 d-h:m:s
//! ```
//!
//! 纯整数表示秒。

use crate::error::{Error, Result};
use std::time::Duration;

pub fn parse_time(text: &str) -> Result<Duration> {
    let text = text.trim();
    let bad = || Error::parse("时间", text);

    let (days, hms) = match text.split_once('-') {
        Some((d, rest)) => (parse_number(d).ok_or_else(bad)?, rest),
        None => (0, text),
    };

    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() > 3 {
        return Err(bad());
    }
    let mut secs = days.checked_mul(24 * 3600).ok_or_else(bad)?;
    for (part, unit) in parts.iter().rev().zip([1u64, 60, 3600]) {
        secs = parse_number(part)
            .and_then(|n| n.checked_mul(unit))
            .and_then(|n| secs.checked_add(n))
            .ok_or_else(bad)?;
    }
    Ok(Duration::from_secs(secs))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// 以秒（整数）或时间语法（字符串）读写 `Duration`
pub mod serde_secs {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct SecsVisitor;

        impl Visitor<'_> for SecsVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "秒数或 d-h:m:s 格式的字符串")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(format!("时间不能为负数: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_time(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SecsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_time("2:05").unwrap(), Duration::from_secs(125));
        assert_eq!(parse_time("1:00:00").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_time("1-0:0:30").unwrap(), Duration::from_secs(86_430));
        assert_eq!(parse_time("2-3").unwrap(), Duration::from_secs(2 * 86_400 + 3));
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        for text in [
            "",
            "x",
            "1:2:3:4",
            "1-2-3",
            "-5",
            "1:",
            "3.5",
            "999999999999999-0",
            "18446744073709551615:0:0",
            "99999999999999999999",
        ] {
            assert!(parse_time(text).is_err(), "{:?}", text);
        }
    }
}
