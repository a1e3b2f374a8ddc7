use thiserror::Error;

use crate::core::fragment::SizeClass;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fragment pool exhausted for size class {class:?}")]
    ResourceExhausted { class: SizeClass },
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("payload of {len} bytes exceeds fragment capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("unknown peer rank {0}")]
    UnknownPeer(u32),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs at error level and aborts the process. Shared queue state must not be
/// touched again once this fires.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        std::process::abort()
    }};
}

pub(crate) use fatal;
