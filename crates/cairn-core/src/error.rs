use thiserror::Error;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CairnError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CairnError::Config(_) => "CONFIG_ERROR",
            CairnError::InvalidSetting { .. } => "INVALID_SETTING",
            CairnError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CairnError>;
