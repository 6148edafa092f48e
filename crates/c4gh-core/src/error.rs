use thiserror::Error;

pub type C4ghResult<T> = Result<T, C4ghError>;

/// Status code reported to the host for a successful operation.
pub const STATUS_OK: i32 = 0;

#[derive(Debug, Error)]
pub enum C4ghError {
    /// Missing or corrupt key file, or wrong passphrase. Fatal before any chunk work.
    #[error("key load error: {0}")]
    KeyLoad(String),

    /// One recipient key file could not be parsed. Recovered by the scanner.
    #[error("receiver key error: {0}")]
    ReceiverKey(String),

    #[error("no recipient public keys available")]
    NoRecipients,

    /// No header packet unwraps with the local key.
    #[error("header parse error: {0}")]
    HeaderParse(String),

    /// Segment MAC mismatch. Never retried, never skipped.
    #[error("segment authentication failed: {0}")]
    Authentication(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("allocation error: {0}")]
    Allocation(String),

    #[error("upload state error: {0}")]
    UploadState(String),

    #[error("operation aborted")]
    Aborted,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl C4ghError {
    /// Stable negative status code for the host boundary.
    pub fn status_code(&self) -> i32 {
        match self {
            C4ghError::KeyLoad(_) => -1,
            C4ghError::ReceiverKey(_) => -2,
            C4ghError::NoRecipients => -3,
            C4ghError::HeaderParse(_) => -4,
            C4ghError::Authentication(_) => -5,
            C4ghError::InvalidInput(_) => -6,
            C4ghError::Allocation(_) => -7,
            C4ghError::UploadState(_) => -8,
            C4ghError::Aborted => -9,
            C4ghError::Config(_) => -10,
            C4ghError::Io(_) => -11,
            C4ghError::Other(_) => -99,
        }
    }

    /// Whether the error ends the whole operation rather than one entry of it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, C4ghError::ReceiverKey(_))
    }
}

/// Collapse a result into the status code the host sees.
pub fn status_of<T>(result: &C4ghResult<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.status_code(),
    }
}
