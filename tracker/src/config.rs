//! Configuration module for the Visit Tracker.
//!
//! The tracker never reads ambient globals: everything it needs is carried
//! by a [`TrackerConfig`] passed to
//! [`Tracker::new`](crate::tracker::Tracker::new). The config can be built
//! in code or parsed from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRACKER_SITE_ID` | No | `0` | Site identifier; `0` disables delivery |
//! | `TRACKER_DEBUG` | No | `false` | Return elements instead of attaching them |
//! | `TRACKER_DYNAMIC_SITE` | No | `false` | Skip automatic page-load tracking |
//! | `TRACKER_HOST` | No | `tr.prospecteye.com` | Tracking host |
//! | `TRACKER_INCLUDES_EXEMPT` | No | (none) | Comma-separated site ids that skip the includes script |
//!
//! # Example
//!
//! ```no_run
//! use visit_tracker::config::TrackerConfig;
//!
//! let config = TrackerConfig::from_env().expect("Failed to load configuration");
//! println!("Tracking host: {}", config.host);
//! ```

use std::env;

use thiserror::Error;

/// Default tracking host.
pub const DEFAULT_HOST: &str = "tr.prospecteye.com";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for a [`Tracker`](crate::tracker::Tracker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Site identifier of the tracked property. `None` disables delivery.
    pub site_id: Option<String>,

    /// Debug mode: elements are returned to the caller, never attached.
    pub debug: bool,

    /// Dynamic sites trigger tracking themselves; automatic page-load
    /// tracking is skipped.
    pub dynamic_site: bool,

    /// Host serving the tracking endpoint (e.g., `tr.prospecteye.com`).
    pub host: String,

    /// Sites that do not load the companion includes script.
    pub includes_exempt: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            debug: false,
            dynamic_site: false,
            host: DEFAULT_HOST.to_string(),
            includes_exempt: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Creates a live configuration for `site_id` with defaults elsewhere.
    #[must_use]
    pub fn for_site(site_id: impl Into<String>) -> Self {
        Self {
            site_id: Some(site_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn with_dynamic_site(mut self, dynamic_site: bool) -> Self {
        self.dynamic_site = dynamic_site;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Creates a new `TrackerConfig` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a boolean variable is set to something
    /// other than `true/false/1/0/yes/no`, or if `TRACKER_HOST` is set but
    /// empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: TRACKER_SITE_ID (default: unset, delivery disabled)
        let site_id = env::var("TRACKER_SITE_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let debug = parse_bool("TRACKER_DEBUG")?;
        let dynamic_site = parse_bool("TRACKER_DYNAMIC_SITE")?;

        // Optional: TRACKER_HOST (default: tr.prospecteye.com)
        let host = match env::var("TRACKER_HOST") {
            Ok(val) => {
                let host = val.trim().trim_end_matches('/').to_string();
                if host.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "TRACKER_HOST".to_string(),
                        message: "host cannot be empty".to_string(),
                    });
                }
                host
            }
            Err(_) => DEFAULT_HOST.to_string(),
        };

        // Optional: TRACKER_INCLUDES_EXEMPT (default: no exemptions)
        let includes_exempt = env::var("TRACKER_INCLUDES_EXEMPT")
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            site_id,
            debug,
            dynamic_site,
            host,
            includes_exempt,
        })
    }
}

/// Parses an optional boolean variable, `false` when unset.
fn parse_bool(key: &str) -> Result<bool, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(false);
    };

    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{val}'"),
        }),
    }
}
