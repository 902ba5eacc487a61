//! Delivery of tracking requests through injected elements.
//!
//! A request is delivered the way a browser loads any third-party resource:
//! a `<script>` or a 1x1 `<iframe>` whose `src` is the tracking endpoint is
//! attached to the document head, and attaching it triggers the fetch. This
//! avoids cross-origin XHR entirely.
//!
//! Elements are only attached when the tracker is live. In debug mode, when
//! the caller asks not to append, or when no site identifier is configured,
//! the element is built and handed back instead so it can be inspected or
//! attached by hand.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::{Document, DISABLED_SITE_ID};
use crate::head::DocumentHead;

/// Width and height of the tracking iframe, in pixels.
const FRAME_SIZE: u32 = 1;

/// Kind of element used to deliver a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendTarget {
    Script,
    Frame,
}

/// A delivery element pointing at the tracking endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Element {
    /// `<script type="text/javascript" src=...>`
    Script { src: String },
    /// `<iframe src=... width=1 height=1>`
    Frame { src: String, width: u32, height: u32 },
}

impl Element {
    /// Address the element loads.
    pub fn src(&self) -> &str {
        match self {
            Self::Script { src } | Self::Frame { src, .. } => src,
        }
    }

    pub fn target(&self) -> AppendTarget {
        match self {
            Self::Script { .. } => AppendTarget::Script,
            Self::Frame { .. } => AppendTarget::Frame,
        }
    }
}

/// Builds delivery elements and attaches them to a document head.
#[derive(Debug)]
pub struct DeliveryChannel<H> {
    host: String,
    site_id: String,
    debug: bool,
    head: H,
}

impl<H: DocumentHead> DeliveryChannel<H> {
    /// Creates a channel for the tracking `host`.
    ///
    /// `site_id` is the configured site identifier; [`DISABLED_SITE_ID`]
    /// keeps every element detached.
    pub fn new(host: impl Into<String>, site_id: impl Into<String>, debug: bool, head: H) -> Self {
        Self {
            host: host.into(),
            site_id: site_id.into(),
            debug,
            head,
        }
    }

    pub fn head(&self) -> &H {
        &self.head
    }

    /// Absolute endpoint for `resource` (a query string or a path on the
    /// tracking host), using the page's scheme.
    pub fn endpoint(&self, page: &Document, resource: &str) -> String {
        let scheme = if page.is_secure() { "https" } else { "http" };
        format!("{scheme}://{}/{resource}", self.host)
    }

    /// Builds the element for `resource` without attaching it.
    pub fn build(&self, page: &Document, resource: &str, target: AppendTarget) -> Element {
        let src = self.endpoint(page, resource);
        match target {
            AppendTarget::Script => Element::Script { src },
            AppendTarget::Frame => Element::Frame {
                src,
                width: FRAME_SIZE,
                height: FRAME_SIZE,
            },
        }
    }

    /// Builds the element for `resource` and attaches it when live.
    ///
    /// Returns `None` when the element was attached, or the detached element
    /// otherwise.
    pub fn send(
        &self,
        page: &Document,
        resource: &str,
        target: AppendTarget,
        should_append: bool,
    ) -> Option<Element> {
        let element = self.build(page, resource, target);

        if self.debug || !should_append {
            debug!(src = %element.src(), debug = self.debug, "Returning detached element");
            return Some(element);
        }

        if self.site_id == DISABLED_SITE_ID {
            debug!(src = %element.src(), "No site identifier configured, element not attached");
            return Some(element);
        }

        debug!(src = %element.src(), target = ?target, "Attaching delivery element");
        self.head.append(element);
        None
    }
}
