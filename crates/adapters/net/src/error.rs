//! Network adapter error types.

use std::time::Duration;

use devicepilot_domain::error::ConditioningError;

/// Errors specific to the network adapter.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no response within {0:?}")]
    ReadTimeout(Duration),

    /// The request failed for a reason other than a timeout.
    #[error("HTTP request failed")]
    Http(#[source] reqwest::Error),

    /// `host:port` did not resolve to any address.
    #[error("probe address {0:?} did not resolve")]
    Unresolved(String),

    #[error("datagram send failed")]
    Io(#[from] std::io::Error),
}

impl From<NetError> for ConditioningError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::ConnectTimeout(after) => Self::ConnectTimeout(after),
            NetError::ReadTimeout(after) => Self::ReadTimeout(after),
            other => Self::Transport(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_keep_timeouts_distinct_when_converting() {
        let err: ConditioningError = NetError::ConnectTimeout(Duration::from_secs(10)).into();
        assert!(matches!(err, ConditioningError::ConnectTimeout(d) if d == Duration::from_secs(10)));

        let err: ConditioningError = NetError::ReadTimeout(Duration::from_secs(15)).into();
        assert!(matches!(err, ConditioningError::ReadTimeout(_)));
    }

    #[test]
    fn should_wrap_other_errors_as_transport() {
        let err: ConditioningError = NetError::Unresolved("nowhere:53".to_string()).into();
        assert!(matches!(err, ConditioningError::Transport(_)));
    }

    #[test]
    fn should_display_unresolved_address() {
        let err = NetError::Unresolved("nowhere:53".to_string());
        assert_eq!(err.to_string(), "probe address \"nowhere:53\" did not resolve");
    }
}
