//! Backend TSDB wire types and client

pub mod kairos;

pub use kairos::KairosClient;

use serde::{Deserialize, Serialize};

use crate::error::BackendQueryFailure;
use crate::series::SeriesResult;

/// Body of a successful datapoint query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KairosResponse {
    #[serde(default)]
    pub queries: Vec<QueryResponse>,
}

/// Per-metric part of a response; also the accumulator responses are built in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub sample_size: usize,
    #[serde(default)]
    pub results: Vec<SeriesResult>,
}

/// Outcome of a non-propagating query
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Success(KairosResponse),
    Error { status_code: u16, error: String },
}

impl BackendReply {
    /// Raise a folded failure
    pub fn into_result(self) -> Result<KairosResponse, BackendQueryFailure> {
        match self {
            BackendReply::Success(response) => Ok(response),
            BackendReply::Error {
                status_code: 0,
                error,
            } => Err(BackendQueryFailure::Connection(error)),
            BackendReply::Error { status_code, error } => Err(BackendQueryFailure::Status {
                status: status_code,
                message: error,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, BackendReply::Error { .. })
    }
}

impl From<BackendQueryFailure> for BackendReply {
    fn from(failure: BackendQueryFailure) -> Self {
        let status_code = failure.status_code();
        let error = match failure {
            BackendQueryFailure::Status { message, .. } => message,
            BackendQueryFailure::Connection(message) => message,
            malformed @ BackendQueryFailure::Malformed(_) => malformed.to_string(),
        };
        BackendReply::Error { status_code, error }
    }
}

/// Raw response of a proxied metadata request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: String,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Messages from a KairosDB error body (`{"errors": [...]}`), joined
pub fn error_messages(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join(", "),
        _ => "No message given".to_string(),
    }
}
