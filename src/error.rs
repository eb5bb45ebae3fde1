use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtlError {
    /// Missing binaries or a broken platform setup. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Download or control-call failure; the caller decides whether to retry.
    #[error("network error: {0}")]
    Network(String),

    /// Checksum mismatch, corrupt manifest or bad archive.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("compiler_proxy lock and/or socket is owned by others. details={details}")]
    OwnershipConflict { details: String },

    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("rollback requested without a backup of the current package")]
    NoBackup,

    #[error("compiler_proxy error: {0}")]
    Daemon(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("{0}")]
    Other(String),
}

impl CtlError {
    pub fn slug(&self) -> &str {
        match self {
            Self::Config(_) => "error-config",
            Self::Network(_) => "error-network",
            Self::Integrity(_) => "error-integrity",
            Self::OwnershipConflict { .. } => "error-ownership-conflict",
            Self::UpdateFailed(_) => "error-update-failed",
            Self::NoBackup => "error-no-backup",
            Self::Daemon(_) => "error-daemon",
            Self::Io(_) => "error-io",
            Self::Serialization(_) => "error-serialization",
            Self::Http(_) => "error-http",
            Self::Archive(_) => "error-archive",
            Self::Other(_) => "error-other",
        }
    }

    /// Transient failures are surfaced to the operator as "try again" rather
    /// than as a broken installation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }

    /// Errors a control call must not fold into a failed reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::OwnershipConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, CtlError>;
