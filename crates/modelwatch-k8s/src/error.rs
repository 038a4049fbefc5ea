use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`ClusterApi`](crate::ClusterApi) operations
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// The watch cursor is older than what the server retains (HTTP 410)
    #[error("watch cursor expired: {0}")]
    Expired(String),

    #[error("cluster api returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("cluster api request failed: {0}")]
    Transport(#[source] kube::Error),

    #[error("failed to decode cluster object: {0}")]
    Decode(#[from] serde_json::Error),

    /// No answer from the API server within the caller's deadline
    #[error("cluster api did not respond within {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Status { code: 404, .. })
    }

    /// Map a server-side status code onto the taxonomy
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            410 => Self::Expired(message),
            _ => Self::Status { code, message },
        }
    }

    /// Classify a kube error, turning 404s on a named object into `NotFound`
    pub(crate) fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) => Self::from_status(resp.code, resp.message),
            other => Self::Transport(other),
        }
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Self::from_status(resp.code, resp.message),
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(ApiError::from_status(410, "too old"), ApiError::Expired(_)));
        assert!(ApiError::from_status(404, "gone").is_not_found());
        assert!(!ApiError::from_status(500, "boom").is_not_found());
        assert!(!ApiError::TimedOut(Duration::from_secs(10)).is_not_found());
    }

    #[test]
    fn test_not_found_message() {
        let err = ApiError::NotFound {
            kind: "inferenceservices".to_string(),
            namespace: "ns".to_string(),
            name: "flowers".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "inferenceservices 'flowers' not found in namespace 'ns'"
        );
        assert_eq!(
            ApiError::TimedOut(Duration::from_secs(10)).to_string(),
            "cluster api did not respond within 10s"
        );
    }
}
