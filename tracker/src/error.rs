//! Error types for the Visit Tracker.
//!
//! Tracking itself degrades to safe defaults and never fails; these errors
//! cover building a tracker and the HTTP delivery that backs
//! [`FetchingHead`](crate::head::FetchingHead).

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while setting up or delivering tracking requests.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A component that schedules work was created outside a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The tracking endpoint answered with a non-success status.
    #[error("tracking endpoint rejected request with status {status}")]
    Rejected { status: u16 },

    /// A delivery address could not be parsed.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
