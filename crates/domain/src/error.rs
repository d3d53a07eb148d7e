/// Shared error type used across all Voxflow crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {message}")]
    Validation {
        message: String,
        /// Offending fields, when known.
        fields: Vec<String>,
    },

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    /// Retryable failure (network hiccup, provider 5xx). Callers retry
    /// with exponential backoff before surfacing a 503.
    #[error("transient: {0}")]
    Transient(String),

    /// Non-retryable provider rejection, e.g. `insufficient_funds` or
    /// `unreachable_number`. The reason string maps to a contact outcome.
    #[error("provider {provider}: {reason}")]
    Provider { provider: String, reason: String },

    /// The store cannot serve requests (backing files unreadable).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn validation_fields(
        message: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Error::Validation {
            message: message.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Unavailable(_))
    }

    /// Provider reason string, when this is a provider rejection.
    pub fn provider_reason(&self) -> Option<&str> {
        match self {
            Error::Provider { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(Error::Unavailable("disk".into()).is_transient());
        assert!(!Error::NotFound("call".into()).is_transient());
        assert!(!Error::Provider {
            provider: "twilio".into(),
            reason: "insufficient_funds".into()
        }
        .is_transient());
    }

    #[test]
    fn provider_reason_extraction() {
        let err = Error::Provider {
            provider: "twilio".into(),
            reason: "unreachable_number".into(),
        };
        assert_eq!(err.provider_reason(), Some("unreachable_number"));
        assert_eq!(Error::RateLimited.provider_reason(), None);
    }
}
