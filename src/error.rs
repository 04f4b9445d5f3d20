use thiserror::Error;

#[derive(Error, Debug)]
pub enum DubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Subtitle error: {0}")]
    Subtitle(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Mux error: {0}")]
    Mux(String),

    #[error("Audio processing error: {0}")]
    Audio(String),

    #[error("Voice profile store error: {0}")]
    Store(String),

    #[error("Stage ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// How the scheduler treats a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Missing or corrupt media/subtitles; never retried.
    Input,
    /// Adapter failed or returned an unusable result; retried with backoff.
    Model,
    /// GPU/disk/store trouble; retried with backoff, then stuck.
    Resource,
    /// Container write failed; retried once.
    Mux,
    /// Episode was cancelled; resumable, not retried automatically.
    Cancelled,
}

impl DubError {
    pub fn class(&self) -> FailureClass {
        match self {
            DubError::Input(_)
            | DubError::Subtitle(_)
            | DubError::Media(_)
            | DubError::Audio(_)
            | DubError::Config(_)
            | DubError::FileNotFound(_)
            | DubError::UnsupportedFormat(_)
            | DubError::Json(_)
            | DubError::Toml(_)
            | DubError::TomlSer(_)
            | DubError::Wav(_) => FailureClass::Input,
            DubError::Model(_) | DubError::Http(_) => FailureClass::Model,
            DubError::Resource(_) | DubError::Io(_) | DubError::Store(_) | DubError::Ledger(_) => {
                FailureClass::Resource
            }
            DubError::Mux(_) => FailureClass::Mux,
            DubError::Cancelled(_) => FailureClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Model | FailureClass::Resource | FailureClass::Mux
        )
    }
}

pub type Result<T> = std::result::Result<T, DubError>;
