//! Error types for the cache server.
//!
//! Mirrors the seven error kinds in the design: protocol violations, resource
//! policy rejections, storage corruption, snapshot I/O failure, snapshot
//! format mismatch, upstream connectivity failure, and shared-directory parse
//! errors. None of these propagate to clients as typed failures -- clients
//! only ever see the canonical per-request outcomes. This type exists for the
//! API boundary: construction, config load, snapshot I/O, CLI.

use std::fmt;

#[derive(Debug)]
pub enum CacheServerError {
    Io(std::io::Error),
    Serialization(String),
    Config(String),
    Protocol(String),
    SnapshotFormat(String),
    Remote(String),
    SharedDirectory(String),
}

impl fmt::Display for CacheServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheServerError::Io(e) => write!(f, "I/O error: {}", e),
            CacheServerError::Serialization(s) => write!(f, "serialization error: {}", s),
            CacheServerError::Config(s) => write!(f, "configuration error: {}", s),
            CacheServerError::Protocol(s) => write!(f, "protocol violation: {}", s),
            CacheServerError::SnapshotFormat(s) => write!(f, "snapshot format mismatch: {}", s),
            CacheServerError::Remote(s) => write!(f, "remote connectivity error: {}", s),
            CacheServerError::SharedDirectory(s) => write!(f, "shared directory error: {}", s),
        }
    }
}

impl std::error::Error for CacheServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheServerError {
    fn from(e: std::io::Error) -> Self {
        CacheServerError::Io(e)
    }
}

impl From<bincode::Error> for CacheServerError {
    fn from(e: bincode::Error) -> Self {
        CacheServerError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CacheServerError {
    fn from(e: serde_json::Error) -> Self {
        CacheServerError::SharedDirectory(e.to_string())
    }
}

impl From<toml::de::Error> for CacheServerError {
    fn from(e: toml::de::Error) -> Self {
        CacheServerError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for CacheServerError {
    fn from(e: toml::ser::Error) -> Self {
        CacheServerError::Config(e.to_string())
    }
}

pub type CacheServerResult<T> = Result<T, CacheServerError>;
