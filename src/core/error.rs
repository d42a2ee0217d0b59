use crate::core::model::TaskId;
use reqwest::StatusCode;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("access to task {0} is forbidden")]
    Forbidden(TaskId),

    /// Results are not materialized yet. A signal to wait, not a failure.
    #[error("results for task {0} are not ready yet")]
    NotReady(TaskId),

    #[error("server unreachable{}: {message}", status_suffix(.status))]
    Unreachable { status: Option<u16>, message: String },

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tracking cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TrackerError {
    /// Maps a non-success HTTP status to an error. 202 only counts as
    /// `NotReady` when the caller is asking for results.
    pub fn from_status(status: StatusCode, task_id: &str, results: bool) -> Option<Self> {
        match status {
            StatusCode::ACCEPTED if results => Some(Self::NotReady(task_id.to_string())),
            s if s.is_success() => None,
            StatusCode::NOT_FOUND => Some(Self::NotFound(task_id.to_string())),
            StatusCode::FORBIDDEN => Some(Self::Forbidden(task_id.to_string())),
            s if is_retryable_status(s) => Some(Self::Unreachable {
                status: Some(s.as_u16()),
                message: s.canonical_reason().unwrap_or("server error").to_string(),
            }),
            s => Some(Self::Status(s.as_u16())),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Protocol(e.to_string());
        }
        if e.is_builder() {
            return Self::InvalidRequest(e.to_string());
        }
        Self::Unreachable {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<url::ParseError> for TrackerError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (http {s})")).unwrap_or_default()
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(TrackerError::from_status(StatusCode::OK, "t", false), None);
        assert_eq!(
            TrackerError::from_status(StatusCode::NOT_FOUND, "t", false),
            Some(TrackerError::NotFound("t".into()))
        );
        assert_eq!(
            TrackerError::from_status(StatusCode::FORBIDDEN, "t", true),
            Some(TrackerError::Forbidden("t".into()))
        );
        assert!(matches!(
            TrackerError::from_status(StatusCode::SERVICE_UNAVAILABLE, "t", false),
            Some(TrackerError::Unreachable { status: Some(503), .. })
        ));
        assert_eq!(
            TrackerError::from_status(StatusCode::BAD_REQUEST, "t", false),
            Some(TrackerError::Status(400))
        );
    }

    #[test]
    fn accepted_is_only_not_ready_for_results() {
        assert_eq!(TrackerError::from_status(StatusCode::ACCEPTED, "t", false), None);
        assert_eq!(
            TrackerError::from_status(StatusCode::ACCEPTED, "t", true),
            Some(TrackerError::NotReady("t".into()))
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::ACCEPTED));
    }

    #[test]
    fn unreachable_display_mentions_status() {
        let e = TrackerError::Unreachable { status: Some(503), message: "Service Unavailable".into() };
        assert_eq!(e.to_string(), "server unreachable (http 503): Service Unavailable");
        let e = TrackerError::Unreachable { status: None, message: "connection refused".into() };
        assert_eq!(e.to_string(), "server unreachable: connection refused");
    }
}
