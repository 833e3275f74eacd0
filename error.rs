use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Initialization Failed: {0}")]
    Init(String),

    #[error("Reference Error: {0}")]
    Reference(String),

    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Inference Error: {0}")]
    Inference(String),

    #[error("Session Busy: a classification is already running")]
    Busy,

    #[error("Model Unavailable: {0}")]
    Unavailable(String),
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Decode(err.to_string())
    }
}

/// Coarse failure category reported to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Initialization,
    Reference,
    Decode,
    Inference,
    Busy,
    Unavailable,
    Other,
}

impl Error {
    pub fn category(&self) -> FailureKind {
        match self {
            Error::Init(_) => FailureKind::Initialization,
            Error::Reference(_) => FailureKind::Reference,
            Error::Decode(_) => FailureKind::Decode,
            Error::Inference(_) => FailureKind::Inference,
            Error::Busy => FailureKind::Busy,
            Error::Unavailable(_) => FailureKind::Unavailable,
            Error::Io(_) | Error::Json(_) | Error::Config(_) => FailureKind::Other,
        }
    }

    /// Per-request failures leave the session usable; the rest do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            FailureKind::Reference | FailureKind::Decode | FailureKind::Inference | FailureKind::Busy
        )
    }
}
