//! Flow error classification for the refresh path
//!
//! Dead grants (invalid, expired, revoked) must never be retried: the user has
//! to log in again. Everything else, including errors we do not recognize, is
//! transient and subject to the coordinator's backoff.

use provider::{ErrorClassification, FlowError};

use crate::error::RefreshError;

/// Map a flow error from `OAuthFlow::refresh` onto a refresh outcome.
pub fn classify_flow_error(err: FlowError) -> RefreshError {
    match err.classify() {
        ErrorClassification::Authentication => RefreshError::ReauthRequired(err.to_string()),
        ErrorClassification::Transient => RefreshError::Failed(err.to_string()),
    }
}

impl From<FlowError> for RefreshError {
    fn from(err: FlowError) -> Self {
        classify_flow_error(err)
    }
}
