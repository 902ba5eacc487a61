//! Visit Tracker - page visit tracking client.
//!
//! This crate composes visit-tracking requests from page state and delivers
//! them the way a third-party tracking snippet does in a browser: by
//! attaching a script or iframe element whose address carries the request.
//!
//! # Overview
//!
//! A [`Tracker`] resolves the visit from a [`Frame`] (address, title,
//! referrer with cross-frame fallback, cookie capability), merges caller
//! [`TrackingOverrides`], encodes the query and hands it to the delivery
//! channel. Callers that need to know when delivery is done pass a callback;
//! it receives a [`Completion`] telling an acknowledged delivery apart from a
//! timeout.
//!
//! # Modules
//!
//! - [`query`]: Query string encoding and extra-data formatting
//! - [`environment`]: Frame hierarchy model and environment resolver
//! - [`delivery`]: Script/iframe delivery elements
//! - [`head`]: Document heads that receive elements (recording, fetching)
//! - [`completion`]: Completion tokens and the bounded poller
//! - [`tracker`]: The orchestrating tracker
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for tracker operations

pub mod completion;
pub mod config;
pub mod delivery;
pub mod environment;
pub mod error;
pub mod head;
pub mod query;
pub mod tracker;

pub use completion::{
    Completion, CompletionCallback, CompletionPoller, CompletionRegistry, CompletionStatus,
    CompletionToken,
};
pub use config::{ConfigError, TrackerConfig};
pub use delivery::{AppendTarget, DeliveryChannel, Element};
pub use environment::{AccessDenied, Document, EnvironmentResolver, Frame, ReferrerCache};
pub use error::{Result, TrackerError};
pub use head::{DocumentHead, FetchingHead, RecordingHead};
pub use query::{PeData, TrackingRequest};
pub use tracker::{Tracker, TrackingOverrides};
