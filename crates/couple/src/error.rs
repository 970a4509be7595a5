use thiserror::Error;

use attention::AttentionError;

pub type Result<T> = std::result::Result<T, CoupleError>;

#[derive(Error, Debug)]
pub enum CoupleError {
    #[error("unsupported orientation '{0}', expected 'horizontal' or 'vertical'")]
    UnsupportedOrientation(String),

    #[error("unsupported patch mode '{0}', expected 'Attention' or 'Latent'")]
    UnsupportedPatchMode(String),

    #[error("inconsistent region shapes: region {index} is {found:?}, expected {expected:?}")]
    InconsistentRegionShapes {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid input `{field}`: {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attention error: {0}")]
    Attention(#[from] AttentionError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl CoupleError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}
