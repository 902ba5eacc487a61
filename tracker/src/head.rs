//! Document heads that receive delivery elements.
//!
//! Attaching an element to a page's `<head>` is what makes a browser fetch
//! it. [`DocumentHead`] abstracts that step:
//!
//! - [`RecordingHead`] keeps attached elements in memory, for inspection and
//!   dry runs.
//! - [`FetchingHead`] performs the fetch itself with a pooled HTTP client,
//!   fire-and-forget. When the fetched address carries a `frontendid` and
//!   the endpoint answers with a success status, the matching completion
//!   token is acknowledged.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Client;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::completion::{CompletionRegistry, CompletionToken};
use crate::delivery::Element;
use crate::error::{Result, TrackerError};

/// Query parameter carrying the completion token.
pub const FRONTEND_ID_PARAM: &str = "frontendid";

/// HTTP request timeout for tracking fetches.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Receives elements attached to a page.
pub trait DocumentHead: Send + Sync {
    /// Attaches an element to the document.
    fn append(&self, element: Element);
}

/// In-memory head that records every attached element.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingHead {
    elements: Arc<Mutex<Vec<Element>>>,
}

impl RecordingHead {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Element>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Elements attached so far, in attachment order.
    pub fn elements(&self) -> Vec<Element> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl DocumentHead for RecordingHead {
    fn append(&self, element: Element) {
        self.lock().push(element);
    }
}

/// Head that fetches every attached element over HTTP.
#[derive(Debug)]
pub struct FetchingHead {
    client: Client,
    runtime: Handle,
    registry: Option<CompletionRegistry>,
    in_flight: Mutex<JoinSet<()>>,
}

impl FetchingHead {
    /// Creates a fetching head on the current Tokio runtime.
    ///
    /// With a `registry`, successful fetches acknowledge their completion
    /// token.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::NoRuntime`] outside a Tokio runtime and
    /// [`TrackerError::Http`] if the HTTP client cannot be built.
    pub fn new(registry: Option<CompletionRegistry>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            runtime,
            registry,
            in_flight: Mutex::new(JoinSet::new()),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of fetches that have not finished yet.
    pub fn in_flight_len(&self) -> usize {
        let mut in_flight = self.in_flight();
        while in_flight.try_join_next().is_some() {}
        in_flight.len()
    }

    /// Waits for outstanding fetches, giving up after `timeout`.
    ///
    /// Returns the number of fetches abandoned at the deadline.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let mut in_flight = std::mem::take(&mut *self.in_flight());
        if in_flight.is_empty() {
            return 0;
        }

        info!(fetches = in_flight.len(), "Waiting for tracking fetches");
        let drained = tokio::time::timeout(timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Timeout while waiting for tracking fetches"
            );
        }
        in_flight.len()
    }
}

impl DocumentHead for FetchingHead {
    fn append(&self, element: Element) {
        let client = self.client.clone();
        let registry = self.registry.clone();
        let src = element.src().to_string();

        let mut in_flight = self.in_flight();
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn_on(
            async move {
                if let Err(e) = fetch(&client, &src, registry.as_ref()).await {
                    warn!(src = %src, error = %e, "Tracking fetch failed");
                }
            },
            &self.runtime,
        );
    }
}

/// Fetches `src` and acknowledges its completion token on success.
async fn fetch(client: &Client, src: &str, registry: Option<&CompletionRegistry>) -> Result<()> {
    let url = Url::parse(src)?;
    let token = url
        .query_pairs()
        .find(|(key, _)| key == FRONTEND_ID_PARAM)
        .map(|(_, value)| CompletionToken::from(value.into_owned()));

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TrackerError::Rejected {
            status: status.as_u16(),
        });
    }

    debug!(src = %src, status = status.as_u16(), "Tracking fetch succeeded");

    if let (Some(registry), Some(token)) = (registry, token) {
        registry.mark_complete(&token);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_head_keeps_order() {
        let head = RecordingHead::new();
        let shared = head.clone();
        assert!(head.is_empty());

        head.append(Element::Script {
            src: "https://tr.example.net/a".to_string(),
        });
        shared.append(Element::Script {
            src: "https://tr.example.net/b".to_string(),
        });

        let srcs: Vec<String> = head.elements().iter().map(|e| e.src().to_string()).collect();
        assert_eq!(srcs, ["https://tr.example.net/a", "https://tr.example.net/b"]);
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn test_fetching_head_requires_runtime() {
        let result = FetchingHead::new(None);
        assert!(matches!(result, Err(TrackerError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_flush_without_fetches() {
        let head = FetchingHead::new(None).unwrap();
        assert_eq!(head.flush(Duration::from_millis(10)).await, 0);
        assert_eq!(head.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_src_is_reported() {
        let client = Client::new();
        let result = fetch(&client, "not a url", None).await;
        assert!(matches!(result, Err(TrackerError::Url(_))));
    }
}
