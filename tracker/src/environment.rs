//! Page environment model and the resolver that reads tracking fields from it.
//!
//! A [`Frame`] is one browsing context: its [`Document`], the visitor's
//! cookie capability, and an optional parent frame. Reading another frame's
//! document is subject to the same-origin rule and fails with
//! [`AccessDenied`] across origins.
//!
//! Frames embedded in a cross-origin page cannot read the top-level
//! referrer. To help them, every frame owns a [`ReferrerCache`] that its
//! children write their own address into; a denied sibling then falls back
//! to the cached value. The cache is handed down explicitly with the frame
//! hierarchy instead of being stashed on a shared global.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::trace;
use url::{Origin, Url};

/// Site identifier used when none is configured. Disables delivery.
pub const DISABLED_SITE_ID: &str = "0";

/// A cross-origin document access was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("access to a cross-origin frame was denied")]
pub struct AccessDenied;

/// The document loaded in a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    /// Full address of the document.
    pub location: String,
    /// Document title, if any.
    pub title: Option<String>,
    /// Address of the page that linked here, empty when unknown.
    pub referrer: String,
}

impl Document {
    /// Creates a document with no title and no referrer.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            title: None,
            referrer: String::new(),
        }
    }

    /// Sets the document title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the document referrer.
    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    /// Returns true when the document was loaded over https.
    pub fn is_secure(&self) -> bool {
        Url::parse(&self.location)
            .map(|url| url.scheme() == "https")
            .unwrap_or(false)
    }
}

/// Referrer slot a frame exposes to its child frames.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct ReferrerCache {
    slot: Arc<Mutex<Option<String>>>,
}

impl ReferrerCache {
    /// Returns the cached address, if one has been stored.
    pub fn get(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stores an address, replacing any previous one.
    pub fn set(&self, address: impl Into<String>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.into());
    }
}

/// A browsing context in a frame hierarchy.
#[derive(Debug)]
pub struct Frame {
    document: Document,
    origin: Origin,
    cookie_enabled: bool,
    parent: Option<Arc<Frame>>,
    referrer_cache: ReferrerCache,
}

impl Frame {
    /// Creates a top-level frame with cookies enabled.
    pub fn new(document: Document) -> Self {
        Self {
            origin: origin_of(&document.location),
            document,
            cookie_enabled: true,
            parent: None,
            referrer_cache: ReferrerCache::default(),
        }
    }

    /// Creates a frame embedded in `parent`.
    ///
    /// The child inherits the parent's cookie capability.
    pub fn child(parent: &Arc<Frame>, document: Document) -> Self {
        Self {
            origin: origin_of(&document.location),
            document,
            cookie_enabled: parent.cookie_enabled,
            parent: Some(Arc::clone(parent)),
            referrer_cache: ReferrerCache::default(),
        }
    }

    /// Sets whether the visitor's browser accepts cookies.
    #[must_use]
    pub fn with_cookies(mut self, enabled: bool) -> Self {
        self.cookie_enabled = enabled;
        self
    }

    /// This frame's own document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn cookie_enabled(&self) -> bool {
        self.cookie_enabled
    }

    pub fn parent(&self) -> Option<&Frame> {
        self.parent.as_deref()
    }

    /// The outermost frame of the hierarchy; `self` for a top-level frame.
    pub fn top(&self) -> &Frame {
        let mut frame = self;
        while let Some(parent) = frame.parent() {
            frame = parent;
        }
        frame
    }

    /// The slot this frame's children use to leave their address behind.
    pub fn referrer_cache(&self) -> &ReferrerCache {
        &self.referrer_cache
    }

    /// Reads another frame's document from this frame.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] when `other` is served from a different
    /// origin.
    pub fn document_of<'a>(&self, other: &'a Frame) -> Result<&'a Document, AccessDenied> {
        if std::ptr::eq(self, other) || self.origin == other.origin {
            Ok(&other.document)
        } else {
            Err(AccessDenied)
        }
    }
}

fn origin_of(location: &str) -> Origin {
    Url::parse(location)
        .map(|url| url.origin())
        .unwrap_or_else(|_| Origin::new_opaque())
}

/// Reads tracking fields from the page environment.
///
/// Every accessor has a safe default; none of them fail.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    site_id: Option<String>,
}

impl EnvironmentResolver {
    /// Creates a resolver for the given configured site identifier.
    pub fn new(site_id: Option<String>) -> Self {
        Self { site_id }
    }

    /// Address of the frame's document.
    pub fn url(&self, frame: &Frame) -> String {
        frame.document().location.clone()
    }

    /// Document title, or an empty string when the page has none.
    pub fn page_name(&self, frame: &Frame) -> String {
        frame
            .document()
            .title
            .as_deref()
            .filter(|title| !title.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    /// Configured site identifier, or [`DISABLED_SITE_ID`].
    pub fn site_id(&self) -> &str {
        self.site_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(DISABLED_SITE_ID)
    }

    pub fn cookie_enabled(&self, frame: &Frame) -> bool {
        frame.cookie_enabled()
    }

    /// Resolves the referrer of the visit.
    ///
    /// The top-level document's referrer is preferred. When it cannot be
    /// read, the chain continues with the parent's cached referrer, the
    /// parent's own referrer, and finally this frame's referrer. Framed
    /// documents leave their address in the parent's cache for siblings.
    pub fn referrer(&self, frame: &Frame) -> String {
        let referrer = match frame.document_of(frame.top()) {
            Ok(top) => top.referrer.clone(),
            Err(denied) => {
                trace!(error = %denied, "Top-level referrer unavailable, falling back");
                fallback_referrer(frame)
            }
        };

        if let Some(parent) = frame.parent() {
            parent.referrer_cache().set(frame.document().location.as_str());
        }

        referrer
    }
}

fn fallback_referrer(frame: &Frame) -> String {
    let Some(parent) = frame.parent() else {
        return frame.document().referrer.clone();
    };

    if let Some(cached) = parent.referrer_cache().get().filter(|r| !r.is_empty()) {
        return cached;
    }

    match frame.document_of(parent) {
        Ok(document) => document.referrer.clone(),
        Err(_) => frame.document().referrer.clone(),
    }
}
