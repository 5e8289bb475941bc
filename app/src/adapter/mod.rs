pub mod quake_feed;
pub mod thermostat;
pub mod zigbee;

use coordinator::UpdateError;

/// Maps HTTP failures onto the refresh error classes: connectivity and
/// server trouble is retryable, rejected credentials are not.
pub(crate) fn classify_http_error(error: reqwest::Error) -> UpdateError {
    if error.is_timeout() {
        return UpdateError::transient(format!("request timed out: {error}"));
    }

    if let Some(status) = error.status() {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return UpdateError::auth(format!("endpoint answered {status}"));
        }
        return UpdateError::transient(format!("endpoint answered {status}"));
    }

    if error.is_connect() || error.is_request() {
        return UpdateError::transient(error.to_string());
    }

    UpdateError::unexpected(error.into())
}
