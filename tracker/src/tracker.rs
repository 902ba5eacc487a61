//! The tracker: resolves, encodes and delivers visit requests.
//!
//! # Example
//!
//! ```no_run
//! use visit_tracker::{
//!     AppendTarget, Completion, Document, Frame, RecordingHead, Tracker, TrackerConfig,
//!     TrackingOverrides,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let head = RecordingHead::new();
//!     let tracker = Tracker::new(TrackerConfig::for_site("a1b2c3"), head.clone()).unwrap();
//!     let page = Frame::new(Document::new("https://www.example.com/").with_title("Home"));
//!
//!     tracker.track(
//!         &page,
//!         TrackingOverrides::default(),
//!         AppendTarget::Script,
//!         true,
//!         Some(Box::new(|completion: Completion| println!("done: {:?}", completion.status))),
//!     );
//!     assert_eq!(head.len(), 1);
//! }
//! ```

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::completion::{CompletionCallback, CompletionPoller, CompletionRegistry};
use crate::config::TrackerConfig;
use crate::delivery::{AppendTarget, DeliveryChannel, Element};
use crate::environment::{EnvironmentResolver, Frame};
use crate::error::{Result, TrackerError};
use crate::head::{DocumentHead, FRONTEND_ID_PARAM};
use crate::query::{self, PeData, TrackingRequest};

/// Companion script loaded after the automatic page-load visit.
pub const INCLUDES_SCRIPT: &str = "track_includes.js";

/// Caller-supplied values that take precedence over the page environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingOverrides {
    pub url: Option<String>,
    pub page_name: Option<String>,
    pub site_id: Option<String>,
    pub referrer: Option<String>,
    pub cookie_enabled: Option<bool>,
    /// Extra payload; dropped silently when its shape is not recognized.
    pub extra_data: Option<PeData>,
}

/// Visit tracker bound to one configuration and one document head.
pub struct Tracker<H> {
    config: TrackerConfig,
    resolver: EnvironmentResolver,
    channel: DeliveryChannel<H>,
    poller: CompletionPoller,
}

impl<H: DocumentHead> Tracker<H> {
    /// Creates a tracker with its own completion registry.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::NoRuntime`] when called outside a Tokio
    /// runtime; completion polling needs one.
    pub fn new(config: TrackerConfig, head: H) -> Result<Self> {
        Self::with_registry(config, head, CompletionRegistry::new())
    }

    /// Creates a tracker sharing `registry` with other components, typically
    /// a [`FetchingHead`](crate::head::FetchingHead) that acknowledges
    /// deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::NoRuntime`] when called outside a Tokio
    /// runtime.
    pub fn with_registry(config: TrackerConfig, head: H, registry: CompletionRegistry) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        let resolver = EnvironmentResolver::new(config.site_id.clone());
        let channel = DeliveryChannel::new(
            config.host.clone(),
            resolver.site_id(),
            config.debug,
            head,
        );

        debug!(
            site_id = %resolver.site_id(),
            host = %config.host,
            debug = config.debug,
            "Tracker created"
        );

        Ok(Self {
            config,
            resolver,
            channel,
            poller: CompletionPoller::new(registry, runtime),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CompletionRegistry {
        self.poller.registry()
    }

    pub fn head(&self) -> &H {
        self.channel.head()
    }

    /// Fills every field the caller did not override from the page.
    pub fn resolve(&self, page: &Frame, overrides: TrackingOverrides) -> TrackingRequest {
        TrackingRequest {
            url: overrides.url.unwrap_or_else(|| self.resolver.url(page)),
            page_name: overrides
                .page_name
                .unwrap_or_else(|| self.resolver.page_name(page)),
            site_id: overrides
                .site_id
                .unwrap_or_else(|| self.resolver.site_id().to_string()),
            referrer: overrides
                .referrer
                .unwrap_or_else(|| self.resolver.referrer(page)),
            cookie_enabled: overrides
                .cookie_enabled
                .unwrap_or_else(|| self.resolver.cookie_enabled(page)),
            extra_data: overrides.extra_data.as_ref().and_then(query::format_pe_data),
        }
    }

    /// Tracks a visit to `page`.
    ///
    /// With `should_append` and a `callback`, a completion token is sent
    /// along with the request and the callback fires once the request is
    /// acknowledged or times out. Without `should_append` the callback is
    /// never invoked.
    ///
    /// Returns the delivery element when it was not attached (debug mode,
    /// `should_append == false`, or no site identifier configured).
    pub fn track(
        &self,
        page: &Frame,
        overrides: TrackingOverrides,
        target: AppendTarget,
        should_append: bool,
        callback: Option<CompletionCallback>,
    ) -> Option<Element> {
        let request = self.resolve(page, overrides);
        let mut query = query::encode(&request);

        match callback {
            Some(callback) if should_append => {
                let token = self.registry().register();
                query.push_str(&format!("&{FRONTEND_ID_PARAM}={token}"));
                self.poller.watch(token, callback);
            }
            Some(_) => debug!("Completion callback ignored for a detached request"),
            None => {}
        }

        self.channel.send(page.document(), &query, target, should_append)
    }

    /// The automatic page-load visit: tracks the page as a script, then
    /// loads the companion includes script unless the site is exempt.
    pub fn track_visit(&self, page: &Frame) {
        self.track(
            page,
            TrackingOverrides::default(),
            AppendTarget::Script,
            true,
            None,
        );

        let site_id = self.resolver.site_id();
        if self.config.includes_exempt.iter().any(|id| id == site_id) {
            debug!(site_id = %site_id, "Site exempt from includes script");
        } else {
            self.channel
                .send(page.document(), INCLUDES_SCRIPT, AppendTarget::Script, true);
        }
    }

    /// Runs [`track_visit`](Self::track_visit) unless the configuration
    /// turns page-load tracking off (debug mode or a dynamic site).
    ///
    /// Returns whether the visit was tracked.
    pub fn auto_track(&self, page: &Frame) -> bool {
        if self.config.debug || self.config.dynamic_site {
            debug!(
                debug = self.config.debug,
                dynamic_site = self.config.dynamic_site,
                "Automatic page-load tracking skipped"
            );
            return false;
        }

        info!(url = %page.document().location, "Tracking page visit");
        self.track_visit(page);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::completion::Completion;
    use crate::environment::Document;
    use crate::head::RecordingHead;

    fn page() -> Frame {
        Frame::new(
            Document::new("https://www.example.com/pricing")
                .with_title("Pricing")
                .with_referrer("https://search.example.org/"),
        )
    }

    fn tracker(config: TrackerConfig) -> (Tracker<RecordingHead>, RecordingHead) {
        let head = RecordingHead::new();
        (Tracker::new(config, head.clone()).unwrap(), head)
    }

    #[tokio::test]
    async fn test_resolve_from_environment() {
        let (tracker, _) = tracker(TrackerConfig::for_site("a1b2c3"));
        let request = tracker.resolve(&page(), TrackingOverrides::default());

        assert_eq!(
            request,
            TrackingRequest {
                url: "https://www.example.com/pricing".to_string(),
                page_name: "Pricing".to_string(),
                site_id: "a1b2c3".to_string(),
                referrer: "https://search.example.org/".to_string(),
                cookie_enabled: true,
                extra_data: None,
            }
        );
    }

    #[tokio::test]
    async fn test_overrides_take_precedence() {
        let (tracker, _) = tracker(TrackerConfig::for_site("a1b2c3"));
        let overrides = TrackingOverrides {
            url: Some("https://www.example.com/virtual/step-2".to_string()),
            page_name: Some("Checkout step 2".to_string()),
            site_id: Some("other".to_string()),
            referrer: Some(String::new()),
            cookie_enabled: Some(false),
            extra_data: Some(PeData::Text("M42".to_string())),
        };
        let request = tracker.resolve(&page(), overrides);

        assert_eq!(request.url, "https://www.example.com/virtual/step-2");
        assert_eq!(request.page_name, "Checkout step 2");
        assert_eq!(request.site_id, "other");
        assert_eq!(request.referrer, "");
        assert!(!request.cookie_enabled);
        assert_eq!(request.extra_data.as_deref(), Some("M42"));
    }

    #[tokio::test]
    async fn test_unrecognized_extra_data_dropped() {
        let (tracker, _) = tracker(TrackerConfig::for_site("a1b2c3").with_debug(true));
        let overrides = TrackingOverrides {
            extra_data: Some(PeData::Text("zzz".to_string())),
            ..TrackingOverrides::default()
        };
        let element = tracker
            .track(&page(), overrides, AppendTarget::Script, true, None)
            .unwrap();
        assert!(!element.src().contains("pe_data"));
    }

    #[tokio::test]
    async fn test_track_attaches_encoded_request() {
        let (tracker, head) = tracker(TrackerConfig::for_site("a1b2c3").with_host("tr.example.net"));
        let returned = tracker.track(
            &page(),
            TrackingOverrides::default(),
            AppendTarget::Frame,
            true,
            None,
        );

        assert!(returned.is_none());
        let elements = head.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(
            elements[0].src(),
            "https://tr.example.net/?url=https%3A%2F%2Fwww.example.com%2Fpricing\
             &pagename=Pricing&id=a1b2c3&ref=https%3A%2F%2Fsearch.example.org%2F&c=true"
        );
        assert_eq!(elements[0].target(), AppendTarget::Frame);
    }

    #[tokio::test]
    async fn test_callback_adds_frontend_id() {
        let (tracker, head) = tracker(TrackerConfig::for_site("a1b2c3"));
        tracker.track(
            &page(),
            TrackingOverrides::default(),
            AppendTarget::Script,
            true,
            Some(Box::new(|_: Completion| {})),
        );

        let src = head.elements()[0].src().to_string();
        let token = src.rsplit_once("&frontendid=").map(|(_, t)| t).unwrap();
        assert_eq!(token.len(), 12);
        assert!(tracker.registry().contains(&token.into()));
        assert_eq!(tracker.registry().pending(), 1);
    }

    #[tokio::test]
    async fn test_callback_ignored_without_append() {
        let (tracker, _) = tracker(TrackerConfig::for_site("a1b2c3"));
        let element = tracker
            .track(
                &page(),
                TrackingOverrides::default(),
                AppendTarget::Script,
                false,
                Some(Box::new(|_: Completion| {})),
            )
            .unwrap();

        assert!(!element.src().contains("frontendid"));
        assert_eq!(tracker.registry().pending(), 0);
    }

    #[tokio::test]
    async fn test_disabled_site_returns_element() {
        let (tracker, head) = tracker(TrackerConfig::default());
        let element = tracker
            .track(&page(), TrackingOverrides::default(), AppendTarget::Script, true, None)
            .unwrap();

        assert!(element.src().contains("&id=0&"));
        assert!(head.is_empty());
    }

    #[tokio::test]
    async fn test_site_override_does_not_enable_delivery() {
        let (tracker, head) = tracker(TrackerConfig::default());
        let overrides = TrackingOverrides {
            site_id: Some("a1b2c3".to_string()),
            ..TrackingOverrides::default()
        };
        let element = tracker.track(&page(), overrides, AppendTarget::Script, true, None);

        assert!(element.is_some());
        assert!(head.is_empty());
    }

    #[tokio::test]
    async fn test_track_visit_loads_includes() {
        let (tracker, head) = tracker(TrackerConfig::for_site("a1b2c3").with_host("tr.example.net"));
        tracker.track_visit(&page());

        let elements = head.elements();
        assert_eq!(elements.len(), 2);
        assert!(elements[0].src().starts_with("https://tr.example.net/?url="));
        assert_eq!(elements[1].src(), "https://tr.example.net/track_includes.js");
    }

    #[tokio::test]
    async fn test_track_visit_exempt_site() {
        let mut config = TrackerConfig::for_site("a1b2c3");
        config.includes_exempt = vec!["a1b2c3".to_string()];
        let (tracker, head) = tracker(config);
        tracker.track_visit(&page());

        assert_eq!(head.len(), 1);
        assert!(!head.elements()[0].src().ends_with(INCLUDES_SCRIPT));
    }

    #[tokio::test]
    async fn test_auto_track_respects_flags() {
        let (live, live_head) = tracker(TrackerConfig::for_site("a1b2c3"));
        assert!(live.auto_track(&page()));
        assert_eq!(live_head.len(), 2);

        let (dynamic, dynamic_head) =
            tracker(TrackerConfig::for_site("a1b2c3").with_dynamic_site(true));
        assert!(!dynamic.auto_track(&page()));
        assert!(dynamic_head.is_empty());

        let (debug, debug_head) = tracker(TrackerConfig::for_site("a1b2c3").with_debug(true));
        assert!(!debug.auto_track(&page()));
        assert!(debug_head.is_empty());
    }

    #[tokio::test]
    async fn test_framed_page_uses_parent_cache() {
        let (tracker, _) = tracker(TrackerConfig::for_site("a1b2c3"));
        let top = Arc::new(page());
        top.referrer_cache().set("https://www.example.com/landing");
        let framed = Frame::child(
            &top,
            Document::new("https://widgets.example.net/form").with_referrer("https://www.example.com/pricing"),
        );

        let request = tracker.resolve(&framed, TrackingOverrides::default());
        assert_eq!(request.referrer, "https://www.example.com/landing");
    }

    #[test]
    fn test_tracker_requires_runtime() {
        let result = Tracker::new(TrackerConfig::default(), RecordingHead::new());
        assert!(matches!(result, Err(TrackerError::NoRuntime)));
    }
}
