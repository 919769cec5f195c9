// Poll cycle behaviour end to end: bootstrap, exactly-once forwarding,
// failure isolation and cursor durability.

use super::test_utils::*;
use palgate_relay::poller::{self, CycleOutcome, PollCycle, PollState};
use palgate_relay::services::auth::{AuthTokenProvider, TokenKind};
use palgate_relay::services::fetcher::Fetcher;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[tokio::test]
async fn test_bootstrap_sets_cursor_without_forwarding() {
    let server = MockServer::start().await;
    serve_feed(
        &server,
        feed_body(vec![entry_json("111111111", 30), entry_json("222222222", 20)]),
    )
    .await;
    let mut h = harness(&server);

    assert_eq!(h.cycle.tick().await, CycleOutcome::Bootstrapped);
    assert!(h.chat.messages().is_empty());
    assert_eq!(cursor_id(&h.cycle), Some(("111111111".to_string(), 30)));
    assert_eq!(h.cycle.state(), PollState::Idle);
}

#[tokio::test]
async fn test_forwards_exactly_new_entries_in_feed_order() {
    let server = MockServer::start().await;
    let (a, b, c, d) = (
        entry_json("100000001", 40),
        entry_json("100000002", 30),
        entry_json("100000003", 20),
        entry_json("100000004", 10),
    );
    serve_feed(&server, feed_body(vec![c.clone(), d.clone()])).await;
    let mut h = harness(&server);
    assert_eq!(h.cycle.tick().await, CycleOutcome::Bootstrapped);

    serve_feed(&server, feed_body(vec![a, b, c, d])).await;
    assert_eq!(h.cycle.tick().await, CycleOutcome::Forwarded(2));

    let messages = h.chat.messages();
    assert_eq!(messages.len(), 1, "new entries go out as one message");
    let lines: Vec<_> = messages[0].lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("79100000001"));
    assert!(lines[1].contains("79100000002"));
    assert!(!messages[0].contains("79100000003"));
    assert_eq!(cursor_id(&h.cycle), Some(("100000001".to_string(), 40)));
}

#[tokio::test]
async fn test_unchanged_feed_sends_nothing() {
    let server = MockServer::start().await;
    serve_feed(
        &server,
        feed_body(vec![entry_json("111111111", 30), entry_json("222222222", 20)]),
    )
    .await;
    let mut h = harness(&server);

    assert_eq!(h.cycle.tick().await, CycleOutcome::Bootstrapped);
    assert_eq!(h.cycle.tick().await, CycleOutcome::NoChange);
    assert_eq!(h.cycle.tick().await, CycleOutcome::NoChange);
    assert!(h.chat.messages().is_empty());
    assert_eq!(cursor_id(&h.cycle), Some(("111111111".to_string(), 30)));
}

#[tokio::test]
async fn test_display_only_changes_do_not_count_as_new() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    let mut renamed = entry_json("111111111", 30);
    renamed["firstname"] = json!("Renamed");
    renamed["reason"] = json!(4);
    serve_feed(&server, feed_body(vec![renamed])).await;

    assert_eq!(h.cycle.tick().await, CycleOutcome::NoChange);
    assert!(h.chat.messages().is_empty());
}

#[tokio::test]
async fn test_cursor_scrolled_out_forwards_whole_window() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("100000009", 5)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    serve_feed(
        &server,
        feed_body(vec![entry_json("100000001", 40), entry_json("100000002", 30)]),
    )
    .await;
    assert_eq!(h.cycle.tick().await, CycleOutcome::Forwarded(2));
    assert_eq!(cursor_id(&h.cycle), Some(("100000001".to_string(), 40)));
}

#[tokio::test]
async fn test_invalid_payloads_leave_cursor_untouched() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    let bad_payloads = vec![
        json!({ "log": [entry_json("999999999", 99)], "err": null, "msg": "busy", "status": "error" }),
        json!({ "log": [entry_json("999999999", 99)], "err": true, "msg": "expired", "status": "ok" }),
        json!({ "log": [], "err": null, "msg": "", "status": "ok" }),
        json!({ "status": "ok" }),
    ];

    for payload in bad_payloads {
        serve_feed(&server, payload).await;
        assert_eq!(h.cycle.tick().await, CycleOutcome::Failed);
        assert_eq!(cursor_id(&h.cycle), Some(("111111111".to_string(), 30)));
        assert_eq!(h.cycle.state(), PollState::Idle);
    }

    assert!(h.chat.messages().is_empty());
    let reports = h.admin.messages();
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.contains("validation failed")));
}

#[tokio::test]
async fn test_fetch_exhaustion_is_reported_and_cursor_kept() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    server.reset().await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert_eq!(h.cycle.tick().await, CycleOutcome::Failed);
    assert_eq!(feed_requests(&server).await, 3);
    assert_eq!(cursor_id(&h.cycle), Some(("111111111".to_string(), 30)));

    let reports = h.admin.messages();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("503"), "unexpected report: {}", reports[0]);

    // Recovery on the next tick.
    serve_feed(
        &server,
        feed_body(vec![entry_json("100000001", 40), entry_json("111111111", 30)]),
    )
    .await;
    assert_eq!(h.cycle.tick().await, CycleOutcome::Forwarded(1));
}

#[tokio::test]
async fn test_failure_report_escapes_upstream_html() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    server.reset().await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string(
            "<html><head><title>502 Bad Gateway</title></head></html>",
        ))
        .mount(&server)
        .await;

    assert_eq!(h.cycle.tick().await, CycleOutcome::Failed);

    let reports = h.admin.messages();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].contains('<'), "unescaped report: {}", reports[0]);
    assert!(reports[0].starts_with("DEV1: fetch failed: "));
    assert!(reports[0].contains("&lt;title&gt;502 Bad Gateway&lt;/title&gt;"));
}

#[tokio::test]
async fn test_failed_forward_does_not_advance_cursor() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let mut h = harness(&server);
    h.cycle.tick().await;

    serve_feed(
        &server,
        feed_body(vec![entry_json("100000001", 40), entry_json("111111111", 30)]),
    )
    .await;
    h.chat.set_failing(true);
    assert_eq!(h.cycle.tick().await, CycleOutcome::Failed);
    assert_eq!(cursor_id(&h.cycle), Some(("111111111".to_string(), 30)));
    assert!(h.admin.messages()[0].contains("forwarding failed"));

    h.chat.set_failing(false);
    assert_eq!(h.cycle.tick().await, CycleOutcome::Forwarded(1));
    assert_eq!(h.chat.messages().len(), 1);
    assert_eq!(cursor_id(&h.cycle), Some(("100000001".to_string(), 40)));

    assert_eq!(h.cycle.tick().await, CycleOutcome::NoChange);
    assert_eq!(h.chat.messages().len(), 1);
}

#[tokio::test]
async fn test_panic_inside_cycle_is_contained() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;

    let admin = RecordingNotifier::new();
    let mut cycle = PollCycle::new(
        feed_target(&server),
        AuthTokenProvider::new(
            Arc::new(CountingGenerator::default()),
            vec![1],
            1,
            TokenKind::Sms,
        ),
        Fetcher::new(Duration::from_secs(2), fast_policy()).unwrap(),
        Arc::new(PanickingNotifier),
        admin.clone(),
    );
    assert_eq!(cycle.tick().await, CycleOutcome::Bootstrapped);

    serve_feed(
        &server,
        feed_body(vec![entry_json("100000001", 40), entry_json("111111111", 30)]),
    )
    .await;
    assert_eq!(cycle.tick().await, CycleOutcome::Failed);
    assert_eq!(cursor_id(&cycle), Some(("111111111".to_string(), 30)));
    assert!(admin.messages()[0].contains("notifier exploded"));
}

#[tokio::test]
async fn test_request_carries_fresh_token_and_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .and(header("User-Agent", "okhttp/4.9.3"))
        .and(header("X-Bt-Token", "token-0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(vec![entry_json(
            "111111111",
            30,
        )])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .and(header("X-Bt-Token", "token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(vec![entry_json(
            "111111111",
            30,
        )])))
        .expect(1)
        .mount(&server)
        .await;

    let mut h = harness(&server);
    assert_eq!(h.cycle.tick().await, CycleOutcome::Bootstrapped);
    assert_eq!(h.cycle.tick().await, CycleOutcome::NoChange);
    assert_eq!(h.tokens.calls.load(Ordering::SeqCst), 2);

    server.verify().await;
}

#[tokio::test]
async fn test_retries_reuse_the_poll_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(FEED_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(vec![entry_json(
            "111111111",
            30,
        )])))
        .mount(&server)
        .await;

    let mut h = harness(&server);
    assert_eq!(h.cycle.tick().await, CycleOutcome::Bootstrapped);
    assert_eq!(h.tokens.calls.load(Ordering::SeqCst), 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(
            request.headers.get("X-Bt-Token").unwrap().to_str().unwrap(),
            "token-0"
        );
    }
}

#[tokio::test]
async fn test_scheduler_ticks_immediately_and_stops_on_shutdown() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let h = harness(&server);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(poller::run(h.cycle, Duration::from_secs(3600), shutdown_rx));

    // The first cycle runs without waiting for the interval.
    for _ in 0..100 {
        if feed_requests(&server).await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(feed_requests(&server).await, 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("scheduler should stop on shutdown")
        .unwrap();
    assert_eq!(feed_requests(&server).await, 1);
    assert!(h.chat.messages().is_empty());
}

#[tokio::test]
async fn test_scheduler_does_nothing_when_already_stopped() {
    let server = MockServer::start().await;
    serve_feed(&server, feed_body(vec![entry_json("111111111", 30)])).await;
    let h = harness(&server);

    let (_shutdown_tx, shutdown_rx) = watch::channel(true);
    poller::run(h.cycle, Duration::from_millis(10), shutdown_rx).await;

    assert_eq!(feed_requests(&server).await, 0);
}
