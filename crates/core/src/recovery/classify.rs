//! Failure taxonomy and message-based classification.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Kind of failure, used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Memory,
    Database,
    AiTimeout,
    Filesystem,
    Websocket,
    Network,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Memory,
        ErrorKind::Database,
        ErrorKind::AiTimeout,
        ErrorKind::Filesystem,
        ErrorKind::Websocket,
        ErrorKind::Network,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Memory => "memory",
            ErrorKind::Database => "database",
            ErrorKind::AiTimeout => "ai_timeout",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Websocket => "websocket",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown error kind: {}", s))
    }
}

// Checked in order; the first match wins.
static PATTERNS: Lazy<Vec<(ErrorKind, Regex)>> = Lazy::new(|| {
    [
        (
            ErrorKind::Memory,
            r"(?i)out of memory|\boom\b|heap|allocation failed|memory limit|cannot allocate",
        ),
        (
            ErrorKind::Database,
            r"(?i)database|sqlite|\bsql\b|deadlock|connection pool|constraint failed|disk i/o error",
        ),
        (
            ErrorKind::AiTimeout,
            r"(?i)\b(ai|llm|model|inference|analysis|completion)\b.*\b(timeout|timed out)\b|\b(timeout|timed out)\b.*\b(ai|llm|model|inference)\b",
        ),
        (
            ErrorKind::Filesystem,
            r"(?i)enoent|eacces|enospc|eisdir|no such file|permission denied|no space left|read-only file system|directory not empty",
        ),
        (
            ErrorKind::Websocket,
            r"(?i)websocket|\bws\b|socket closed|broken pipe",
        ),
        (
            ErrorKind::Network,
            r"(?i)econnrefused|econnreset|etimedout|enotfound|connection refused|connection reset|network|dns|\b(timeout|timed out)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
    .collect()
});

/// Classify a failure. An explicit hint wins over message inspection.
pub fn classify(message: &str, hint: Option<ErrorKind>) -> ErrorKind {
    if let Some(kind) = hint {
        return kind;
    }
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map_or(ErrorKind::Unknown, |(kind, _)| *kind)
}
