//! Request validation filters and the JSON rejection handler

use std::convert::Infallible;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::warn;
use warp::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use warp::{Filter, Rejection, Reply};

use modelwatch_stream::StreamError;

/// RFC 1123 subdomain: lowercase alphanumerics, '-' and '.'
static DNS1123: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 pattern compiles")
});

const MAX_NAME_LEN: usize = 253;

pub fn is_dns1123(value: &str) -> bool {
    value.len() <= MAX_NAME_LEN && DNS1123.is_match(value)
}

/// Why a request was refused before any streaming started
#[derive(Debug)]
pub enum Rejected {
    InvalidName { field: &'static str, value: String },
    Stream(StreamError),
    HeadersTooLarge { size: usize, threshold: usize },
}

impl warp::reject::Reject for Rejected {}

impl Rejected {
    fn response(&self) -> (StatusCode, serde_json::Value) {
        match self {
            Self::InvalidName { field, value } => {
                let status = StatusCode::BAD_REQUEST;
                let body = json!({
                    "success": false,
                    "status": status.as_u16(),
                    "error": format!("Invalid {}: '{}'", field, value),
                });
                (status, body)
            }
            Self::Stream(err) => {
                let status = StatusCode::BAD_REQUEST;
                let mut body = json!({
                    "success": false,
                    "status": status.as_u16(),
                    "error": err.to_string(),
                });
                if let StreamError::TooManyComponents { limit, .. } = err {
                    body["limit"] = json!(*limit);
                }
                (status, body)
            }
            Self::HeadersTooLarge { size, threshold } => {
                let status = StatusCode::PAYLOAD_TOO_LARGE;
                let body = json!({
                    "success": false,
                    "status": status.as_u16(),
                    "error": "Request headers too large",
                    "size": *size,
                    "threshold": *threshold,
                });
                (status, body)
            }
        }
    }
}

/// One path segment that must be a valid resource name
pub fn name(field: &'static str) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path::param::<String>().and_then(move |value: String| async move {
        if is_dns1123(&value) {
            Ok(value)
        } else {
            Err(warp::reject::custom(Rejected::InvalidName { field, value }))
        }
    })
}

/// Thresholds for the combined size of the credential headers
#[derive(Clone, Debug)]
pub struct HeaderLimits {
    pub userid_header: String,
    pub warning: usize,
    pub error: usize,
}

impl HeaderLimits {
    fn measure(&self, headers: &HeaderMap) -> usize {
        let len = |name: &str| headers.get(name).map_or(0, |v| v.as_bytes().len());
        len(AUTHORIZATION.as_str()) + len(&self.userid_header)
    }
}

/// Refuse requests whose credential headers exceed the error threshold;
/// warn above the warning threshold
pub fn header_size(limits: HeaderLimits) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::headers_cloned()
        .and(warp::path::full())
        .and_then(move |headers: HeaderMap, path: warp::path::FullPath| {
            let limits = limits.clone();
            async move {
                let size = limits.measure(&headers);
                if size > limits.error {
                    warn!(size, threshold = limits.error, path = path.as_str(), "Rejecting oversized credential headers");
                    return Err(warp::reject::custom(Rejected::HeadersTooLarge {
                        size,
                        threshold: limits.error,
                    }));
                }
                if size > limits.warning {
                    warn!(size, threshold = limits.warning, path = path.as_str(), "Large credential headers");
                }
                Ok(())
            }
        })
        .untuple_one()
}

/// Turn rejections into `{"success": false, "status", "error"}` bodies
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(rejected) = err.find::<Rejected>() {
        rejected.response()
    } else {
        let status = if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
            StatusCode::METHOD_NOT_ALLOWED
        } else {
            warn!(rejection = ?err, "Unhandled rejection");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = json!({
            "success": false,
            "status": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Error"),
        });
        (status, body)
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns1123_names() {
        assert!(is_dns1123("kubeflow-user"));
        assert!(is_dns1123("sklearn-iris.v2"));
        assert!(is_dns1123("a"));
        assert!(!is_dns1123("Upper"));
        assert!(!is_dns1123("-leading"));
        assert!(!is_dns1123("trailing-"));
        assert!(!is_dns1123("under_score"));
        assert!(!is_dns1123(""));
        assert!(!is_dns1123(&"a".repeat(254)));
    }

    #[test]
    fn test_too_many_components_body_names_limit() {
        let (status, body) = Rejected::Stream(StreamError::TooManyComponents {
            requested: 11,
            limit: 10,
        })
        .response();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({
                "success": false,
                "status": 400,
                "error": "Too many components requested (max 10)",
                "limit": 10
            })
        );
    }

    #[tokio::test]
    async fn test_header_size_guard() {
        let limits = HeaderLimits {
            userid_header: "kubeflow-userid".to_string(),
            warning: 10,
            error: 20,
        };
        let filter = header_size(limits).map(warp::reply).recover(handle_rejection);

        let res = warp::test::request()
            .header("authorization", "Bearer abcdefgh")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .header("authorization", "Bearer abcdefghijklmnop")
            .header("kubeflow-userid", "user@example.com")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["threshold"], 20);
    }
}
