use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// Network or timeout failure; resubmitting the same input may succeed.
    Transient,
    /// Rejected key, rejected content, unknown model. Needs a user change.
    Permanent,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unsupported media '{file_name}': {reason}")]
    UnsupportedMedia { file_name: String, reason: String },

    #[error("invalid turn: {0}")]
    InvalidTurn(String),

    #[error("malformed history: {0}")]
    MalformedHistory(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("operation cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn unsupported_media(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedMedia {
            file_name: file_name.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable tag used in event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedMedia { .. } => "unsupported_media",
            Self::InvalidTurn(_) => "invalid_turn",
            Self::MalformedHistory(_) => "malformed_history",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io { .. } => "io",
            Self::Provider(err) => match err.kind {
                ProviderErrorKind::Transient => "provider_transient",
                ProviderErrorKind::Permanent => "provider_permanent",
            },
            Self::Cancelled => "cancelled",
        }
    }

    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider(err) => Some(err.kind),
            _ => None,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::{ChatError, ProviderError, ProviderErrorKind};

    #[test]
    fn provider_error_kind_is_observable_through_chat_error() {
        let err: ChatError = ProviderError::transient("connection reset").into();
        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::Transient));
        assert_eq!(err.code(), "provider_transient");

        let err: ChatError = ProviderError::permanent("API key not valid")
            .with_status(400)
            .into();
        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::Permanent));
        assert_eq!(
            err.to_string(),
            "permanent provider error: API key not valid"
        );
    }

    #[test]
    fn io_error_display_names_path() {
        let err = ChatError::io(
            "/tmp/missing.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        assert_eq!(err.code(), "io");
        assert!(err.to_string().contains("/tmp/missing.json"));
        assert_eq!(err.provider_kind(), None);
    }
}
