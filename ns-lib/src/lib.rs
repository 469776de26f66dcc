mod blob_id;
mod blob_reader;
mod entry;
mod locator;
mod path;

pub use blob_id::*;
pub use blob_reader::*;
pub use entry::*;
pub use locator::*;
pub use path::*;

use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

#[macro_use]
extern crate log;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum NsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("location resolution failed: {0}")]
    LocationResolutionFailure(String),
    #[error("content fetch failed: {0}")]
    ContentFetchFailure(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("invalid blob id: {0}")]
    InvalidId(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl NsError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => NsError::NotFound(info),
            StatusCode::CONFLICT => NsError::WriteConflict(info),
            _ => NsError::UpstreamUnavailable(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NsError::NotFound(_))
    }
}

pub type NsResult<T> = std::result::Result<T, NsError>;

impl From<std::io::Error> for NsError {
    fn from(err: std::io::Error) -> Self {
        NsError::IoError(err.to_string())
    }
}

/// Shared builder for every outbound client so remote calls are bounded by
/// the configured request timeout.
pub fn build_http_client(timeout: Duration) -> NsResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NsError::Internal(format!("Failed to create client: {}", e)))
}
