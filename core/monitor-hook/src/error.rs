use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Daemon disabled via {0}")]
    Disabled(&'static str),

    #[error("Daemon unreachable at {}: {details}", .path.display())]
    Unreachable { path: PathBuf, details: String },

    #[error("Daemon connection failed: {0}")]
    Transport(String),

    #[error("Daemon returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Daemon rejected request: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Failed to read hook input: {0}")]
    Stdin(#[from] std::io::Error),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HookError {
    /// True when the daemon could not be reached at all, as opposed to the
    /// daemon answering with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, HookError::Unreachable { .. })
    }
}
