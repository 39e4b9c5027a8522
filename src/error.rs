use std::path::PathBuf;

/// Why a request could not be delivered to its success callback.
///
/// Everything except `AuthExpired` is surfaced the moment it is detected.
/// `AuthExpired` is only surfaced once the single refresh-and-replay cycle
/// has been spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Transport(String),
    #[error("No response body, status {status}")]
    EmptyBody { status: u16 },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Authorization expired: {0}")]
    AuthExpired(String),
    #[error("Reddit Error: {code}")]
    Api { code: String },
}

impl RequestError {
    /// Transport and empty-body failures are the ones worth a "Retry" button.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::Transport(_) | RequestError::EmptyBody { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("identity: read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity: malformed credential file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("identity: write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_message_carries_code() {
        let err = RequestError::Api {
            code: "403".into(),
        };
        assert_eq!(err.to_string(), "Reddit Error: 403");
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_body_is_retryable() {
        let err = RequestError::EmptyBody { status: 502 };
        assert_eq!(err.to_string(), "No response body, status 502");
        assert!(err.is_retryable());
    }
}
