//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("\"{0}\" option is missing")]
    Missing(&'static str),

    #[error("invalid {option}: {value}")]
    Invalid {
        option: &'static str,
        value: String,
    },

    #[error("path not openable: {0}")]
    Path(PathBuf),

    #[error("I/O error on \"{0}\": {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("malformed config entry: \"{0}\"")]
    Entry(String),
}

impl Error {
    pub fn invalid(option: &'static str, value: impl ToString) -> Self {
        Self::Invalid {
            option,
            value: value.to_string(),
        }
    }
}
