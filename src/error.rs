use std::time::Duration;
use thiserror::Error;

/// Failure of a single call to the detection or explanation endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint unreachable: {0}")]
    Transport(String),

    #[error("server returned status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("response is missing {0}")]
    EmptyResponse(&'static str),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no response within {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}

impl From<reqwest::Error> for EndpointError {
    fn from(e: reqwest::Error) -> Self {
        // The request URL may carry the API key as a query parameter.
        let e = e.without_url();
        if e.is_decode() {
            EndpointError::Malformed(e.to_string())
        } else {
            EndpointError::Transport(e.to_string())
        }
    }
}

/// A controller transition that was rejected without changing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("no image selected")]
    NoFileSelected,

    #[error("an analysis is already in progress")]
    Busy,

    #[error("no explanation to show")]
    NoExplanation,
}
