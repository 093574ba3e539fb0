//! Error and failure classification for HTTP backends.
//!
//! Clients (hyper, reqwest, ...) convert their own errors into [`HttpError`], which the
//! [`HttpStatusFailureLogic`] then sorts into "fail" and "too busy" for the autoscaler.

use http::StatusCode;
use snafu::Snafu;

use crate::{
    Error as CrateError,
    autoscaler::{FailureLogic, FailureVerdict},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HttpError {
    /// The request never got a response: connect failure, reset, DNS.
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request was malformed before it was sent.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The server answered with a non-success status.
    #[snafu(display("HTTP status {}: {}", status, body))]
    Status { status: StatusCode, body: String },

    #[snafu(display("HTTP request timed out"))]
    Timeout,
}

impl HttpError {
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether repeating the same request may succeed: transport failures, timeouts and
    /// server-side statuses. Client errors other than 408 and 429 are final.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Transport { .. } | HttpError::Timeout => true,
            HttpError::InvalidRequest { .. } => false,
            HttpError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// Maps "slow down" statuses to [`FailureVerdict::TooBusy`] and everything else to
/// [`FailureVerdict::Fail`].
///
/// `429 Too Many Requests` and `503 Service Unavailable` count as "too busy" out of the box;
/// [`with_busy_status`](HttpStatusFailureLogic::with_busy_status) adds more (some APIs use
/// 529 or a 403 with a quota message).
#[derive(Clone, Debug)]
pub struct HttpStatusFailureLogic {
    busy_statuses: Vec<StatusCode>,
}

impl Default for HttpStatusFailureLogic {
    fn default() -> Self {
        Self {
            busy_statuses: vec![StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE],
        }
    }
}

impl HttpStatusFailureLogic {
    pub fn with_busy_status(mut self, status: StatusCode) -> Self {
        if !self.busy_statuses.contains(&status) {
            self.busy_statuses.push(status);
        }
        self
    }

    pub fn busy_statuses(&self) -> &[StatusCode] {
        &self.busy_statuses
    }
}

impl FailureLogic<HttpError> for HttpStatusFailureLogic {
    fn classify(&self, error: &HttpError) -> FailureVerdict {
        match error.status() {
            Some(status) if self.busy_statuses.contains(&status) => FailureVerdict::TooBusy,
            _ => FailureVerdict::Fail,
        }
    }
}
