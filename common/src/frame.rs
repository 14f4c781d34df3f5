use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one stored frame.
///
/// File naming on disk:
///   `<captured_at>.<ext>`         first frame captured in a given second
///   `<captured_at>_<seq>.<ext>`   later frames landing in the same second
///   `<stem>-temp.<ext>`           transient, never a finished frame
///
/// `captured_at` is a UTC Unix timestamp in whole seconds. Ordering is by
/// `(captured_at, seq)`, which is also capture order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FrameId {
    pub captured_at: i64,
    pub seq: u32,
}

const TEMP_SUFFIX: &str = "-temp";

impl FrameId {
    pub fn new(captured_at: i64, seq: u32) -> Self {
        Self { captured_at, seq }
    }

    /// File name without extension.
    pub fn stem(&self) -> String {
        if self.seq == 0 {
            self.captured_at.to_string()
        } else {
            format!("{}_{}", self.captured_at, self.seq)
        }
    }

    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{ext}", self.stem())
    }

    pub fn temp_file_name(&self, ext: &str) -> String {
        format!("{}{TEMP_SUFFIX}.{ext}", self.stem())
    }

    /// Parse a finished frame's file name. Temp files, other extensions and
    /// anything not produced by [`FrameId::file_name`] yield `None`.
    pub fn from_file_name(name: &str, ext: &str) -> Option<Self> {
        let stem = name.strip_suffix(ext)?.strip_suffix('.')?;
        stem.parse().ok()
    }

    pub fn captured_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.captured_at, 0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

impl FromStr for FrameId {
    type Err = FrameIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, seq) = match s.split_once('_') {
            Some((ts, seq)) => (ts, Some(seq)),
            None => (s, None),
        };
        let captured_at = parse_digits(ts)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| FrameIdError(s.to_string()))?;
        let seq = match seq {
            None => 0,
            // `_0` would alias the bare timestamp name.
            Some(seq) => match parse_digits(seq).and_then(|v| u32::try_from(v).ok()) {
                Some(n) if n > 0 => n,
                _ => return Err(FrameIdError(s.to_string())),
            },
        };
        Ok(Self { captured_at, seq })
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl TryFrom<String> for FrameId {
    type Error = FrameIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FrameId> for String {
    fn from(id: FrameId) -> Self {
        id.stem()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid frame id: {0:?}")]
pub struct FrameIdError(pub String);
