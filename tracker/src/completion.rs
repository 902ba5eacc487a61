//! Completion tokens and the bounded poller that reports them.
//!
//! A caller that wants to know when a tracking request is done supplies a
//! callback. The tracker registers a [`CompletionToken`] for it, sends the
//! token along with the request, and hands the callback to the
//! [`CompletionPoller`]. Whoever observes the delivery (for example the
//! [`FetchingHead`](crate::head::FetchingHead) on a successful response)
//! calls [`CompletionRegistry::mark_complete`].
//!
//! # Polling
//!
//! The poller checks the token once immediately, then every 100ms:
//!
//! 1. If the token was marked complete, the callback fires with
//!    [`CompletionStatus::Acknowledged`].
//! 2. If more than 20 polls have elapsed, the token is force-completed and
//!    the callback fires with [`CompletionStatus::TimedOut`].
//! 3. Otherwise the next poll is scheduled.
//!
//! The callback fires exactly once and the token is then dropped from the
//! registry. There is no way to cancel a pending token; an abandoned token
//! still reports, as a timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Interval between two polls of a pending token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of polls after which a pending token times out.
pub const MAX_POLLS: u32 = 20;

/// Number of hex digits in a generated token.
const TOKEN_LEN: usize = 12;

/// Opaque identifier correlating a request with its completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletionToken(String);

impl CompletionToken {
    /// Generates a random 12-digit hex token.
    pub fn generate() -> Self {
        const CHARSET: &[u8] = b"0123456789abcdef";

        let mut rng = rand::rng();
        let token = (0..TOKEN_LEN)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CompletionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CompletionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a pending token reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The token was marked complete by the delivery side.
    Acknowledged,
    /// The poll budget ran out before any acknowledgement arrived.
    TimedOut,
}

/// Report handed to a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: CompletionStatus,
    /// Polls scheduled after the initial check.
    pub polls: u32,
}

impl Completion {
    pub fn is_acknowledged(&self) -> bool {
        self.status == CompletionStatus::Acknowledged
    }
}

/// Callback invoked once a tracking request completes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Shared map of completion tokens to their "completed" flag.
///
/// Cloning is cheap and all clones see the same tokens.
#[derive(Debug, Clone, Default)]
pub struct CompletionRegistry {
    flags: Arc<Mutex<HashMap<CompletionToken, bool>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> MutexGuard<'_, HashMap<CompletionToken, bool>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh pending token.
    pub fn register(&self) -> CompletionToken {
        let mut flags = self.flags();
        loop {
            let token = CompletionToken::generate();
            if !flags.contains_key(&token) {
                flags.insert(token.clone(), false);
                trace!(token = %token, "Registered completion token");
                return token;
            }
        }
    }

    /// Marks a token complete.
    ///
    /// Returns `false` when the token is unknown, e.g. because it already
    /// timed out and was reported.
    pub fn mark_complete(&self, token: &CompletionToken) -> bool {
        match self.flags().get_mut(token) {
            Some(flag) => {
                *flag = true;
                debug!(token = %token, "Completion token acknowledged");
                true
            }
            None => false,
        }
    }

    /// Returns true when the token is registered and marked complete.
    pub fn is_completed(&self, token: &CompletionToken) -> bool {
        self.flags().get(token).copied().unwrap_or(false)
    }

    pub fn contains(&self, token: &CompletionToken) -> bool {
        self.flags().contains_key(token)
    }

    /// Number of registered tokens still waiting for completion.
    pub fn pending(&self) -> usize {
        self.flags().values().filter(|done| !**done).count()
    }

    fn force_complete(&self, token: &CompletionToken) {
        if let Some(flag) = self.flags().get_mut(token) {
            *flag = true;
        }
    }

    fn remove(&self, token: &CompletionToken) {
        self.flags().remove(token);
    }
}

/// Watches completion tokens and fires their callbacks.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    registry: CompletionRegistry,
    runtime: Handle,
    interval: Duration,
    max_polls: u32,
}

impl CompletionPoller {
    /// Creates a poller that schedules its ticks on `runtime`.
    pub fn new(registry: CompletionRegistry, runtime: Handle) -> Self {
        Self {
            registry,
            runtime,
            interval: POLL_INTERVAL,
            max_polls: MAX_POLLS,
        }
    }

    pub fn registry(&self) -> &CompletionRegistry {
        &self.registry
    }

    /// Starts polling `token`, invoking `callback` once it completes.
    ///
    /// Returns immediately; the returned handle resolves after the callback
    /// has run.
    pub fn watch(&self, token: CompletionToken, callback: CompletionCallback) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let interval = self.interval;
        let max_polls = self.max_polls;

        self.runtime.spawn(async move {
            let completion = poll_until_complete(&registry, &token, interval, max_polls).await;
            registry.remove(&token);

            debug!(
                token = %token,
                status = ?completion.status,
                polls = completion.polls,
                "Tracking request completed"
            );
            callback(completion);
        })
    }
}

async fn poll_until_complete(
    registry: &CompletionRegistry,
    token: &CompletionToken,
    interval: Duration,
    max_polls: u32,
) -> Completion {
    let mut polls = 0;

    loop {
        if registry.is_completed(token) {
            return Completion {
                status: CompletionStatus::Acknowledged,
                polls,
            };
        }

        if polls > max_polls {
            registry.force_complete(token);
            return Completion {
                status: CompletionStatus::TimedOut,
                polls,
            };
        }

        polls += 1;
        trace!(token = %token, poll = polls, "Completion token still pending");
        sleep(interval).await;
    }
}
