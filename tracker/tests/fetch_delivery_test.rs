//! Integration tests for HTTP delivery through the fetching head.
//!
//! These tests run a mock tracking host and verify that attached elements
//! are fetched, that successful fetches acknowledge completion tokens, and
//! that failed fetches leave the poller to time out.

use std::time::Duration;

use tokio::sync::oneshot;
use visit_tracker::{
    AppendTarget, Completion, CompletionRegistry, CompletionStatus, Document, FetchingHead, Frame,
    PeData, Tracker, TrackerConfig, TrackingOverrides,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

/// Creates a tracker whose fetching head acknowledges deliveries.
fn create_tracker(server: &MockServer, config: TrackerConfig) -> Tracker<FetchingHead> {
    let host = server.uri().trim_start_matches("http://").to_string();
    let registry = CompletionRegistry::new();
    let head = FetchingHead::new(Some(registry.clone())).expect("runtime is available");
    Tracker::with_registry(config.with_host(host), head, registry).expect("runtime is available")
}

fn home_page() -> Frame {
    Frame::new(
        Document::new("http://www.example.com/")
            .with_title("Home")
            .with_referrer("http://search.example.org/"),
    )
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[tokio::test]
async fn test_tracking_request_is_fetched_and_acknowledged() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("id", "a1b2c3"))
        .and(query_param("pagename", "Home"))
        .and(query_param("ref", "http://search.example.org/"))
        .and(query_param("c", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string("/* ok */"))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::for_site("a1b2c3"));
    let (tx, rx) = oneshot::channel();

    let element = tracker.track(
        &home_page(),
        TrackingOverrides::default(),
        AppendTarget::Script,
        true,
        Some(Box::new(move |completion: Completion| {
            let _ = tx.send(completion);
        })),
    );
    assert!(element.is_none());

    let completion = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("completion within timeout")
        .expect("callback invoked");

    assert_eq!(completion.status, CompletionStatus::Acknowledged);
    assert!(completion.polls <= 20);
    assert_eq!(tracker.registry().pending(), 0);
}

#[tokio::test]
async fn test_rejected_request_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::for_site("a1b2c3"));
    let (tx, rx) = oneshot::channel();

    tracker.track(
        &home_page(),
        TrackingOverrides::default(),
        AppendTarget::Frame,
        true,
        Some(Box::new(move |completion: Completion| {
            let _ = tx.send(completion);
        })),
    );

    let completion = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("completion within timeout")
        .expect("callback invoked");

    assert_eq!(completion.status, CompletionStatus::TimedOut);
    assert_eq!(completion.polls, 21);
}

#[tokio::test]
async fn test_form_payload_reaches_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("pe_data", "Femail=jo@example.com|plan=pro"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::for_site("a1b2c3"));
    let overrides = TrackingOverrides {
        extra_data: Some(PeData::Record(vec![
            ("type".to_string(), "F".to_string()),
            ("email".to_string(), "jo@example.com".to_string()),
            ("plan".to_string(), "pro".to_string()),
        ])),
        ..TrackingOverrides::default()
    };

    tracker.track(&home_page(), overrides, AppendTarget::Script, true, None);

    assert_eq!(tracker.head().flush(Duration::from_secs(5)).await, 0);
}

#[tokio::test]
async fn test_page_visit_fetches_includes_script() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/track_includes.js"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::for_site("a1b2c3"));
    assert!(tracker.auto_track(&home_page()));

    assert_eq!(tracker.head().flush(Duration::from_secs(5)).await, 0);
}

#[tokio::test]
async fn test_debug_mode_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::for_site("a1b2c3").with_debug(true));

    assert!(!tracker.auto_track(&home_page()));
    let element = tracker
        .track(
            &home_page(),
            TrackingOverrides::default(),
            AppendTarget::Script,
            true,
            None,
        )
        .expect("debug mode returns the element");
    assert!(element.src().starts_with(&server.uri()));

    assert_eq!(tracker.head().flush(Duration::from_secs(1)).await, 0);
}

#[tokio::test]
async fn test_unconfigured_site_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, TrackerConfig::default());
    assert!(tracker.auto_track(&home_page()));
    assert_eq!(tracker.head().in_flight_len(), 0);
}
