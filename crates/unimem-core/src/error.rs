use thiserror::Error;

/// Canonical result for the accountant crates.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No advanced accountant was registered under `key`. Callers of the
    /// registry never see this; it selects the delegate accountant instead.
    #[error("advanced memory accountant '{key}' is not available")]
    PluginUnavailable { key: &'static str },

    /// An execution reservation could not be fully granted. Any partial grant
    /// has already been rolled back.
    #[error("low memory: '{owner}' could not reserve {requested} bytes of execution memory")]
    LowMemory { owner: String, requested: u64 },

    #[error("off-heap buffer of '{owner}' at {address:#x} was not produced by the accountant's allocator")]
    InvalidOwnershipTransfer { owner: String, address: usize },

    #[error("allocation failed for {bytes} bytes (owner '{owner}')")]
    Alloc { owner: String, bytes: usize },

    /// Only ever built for logging; the free path swallows it.
    #[error("cleanup failure: {0}")]
    Cleanup(String),

    #[error("memory accountant is closed")]
    Closed,
}

impl Error {
    pub fn is_low_memory(&self) -> bool {
        matches!(self, Error::LowMemory { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
