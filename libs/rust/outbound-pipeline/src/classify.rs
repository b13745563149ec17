//! Failure classification shared by the retry and circuit-breaker policies.

use reqwest::StatusCode;

use crate::{OutboundResponse, PipelineError};

/// Outcome of one pass through a pipeline stage.
pub type Outcome = Result<OutboundResponse, PipelineError>;

/// Decides whether an outcome counts as a handled failure.
pub type FailureClassifier = fn(&Outcome) -> bool;

/// Transient HTTP failure: a 5xx or 408 response, or any transport error.
#[must_use]
pub fn transient_http_failure(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => {
            let status = response.status();
            status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
        }
        Err(error) => error.is_transient(),
    }
}

/// Short description of an outcome for log lines.
pub(crate) fn describe(outcome: &Outcome) -> String {
    match outcome {
        Ok(response) => format!("status code {}", response.status().as_u16()),
        Err(error) => error.to_string(),
    }
}
