//! Action pipeline integration tests
//!
//! Runs the notifier against a mock spreadsheet webhook.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use voicedesk::actions::{SheetRow, SheetWebhook, StatusUpdate, dispatch};
use voicedesk::config::NotificationConfig;
use voicedesk::{ActionEvent, ActionKind, ActionStatus, Notifier, ToolInvocation};

mod common;

fn config(webhook_url: Option<String>) -> NotificationConfig {
    NotificationConfig {
        support_email: "desk@example.com".to_string(),
        webhook_url,
        processing_delay: Duration::from_millis(30),
    }
}

fn ticket() -> ActionEvent {
    let call = ToolInvocation {
        call_id: "t1".to_string(),
        name: "log_support_ticket".to_string(),
        arguments: json!({
            "client_name": "Omar",
            "phone_number": "0122",
            "issue_description": "UPS beeping",
            "urgency": "High"
        }),
    };
    dispatch(&call, "desk@example.com")
        .event
        .expect("ticket event")
}

async fn mock_sheet() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/exec"))
        .and(header("content-type", "text/plain"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn wait_for_requests(server: &MockServer, n: usize) -> Vec<wiremock::Request> {
    for _ in 0..100 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= n {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("webhook did not receive {n} requests");
}

async fn next_status(rx: &mut broadcast::Receiver<StatusUpdate>) -> StatusUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("status update timed out")
        .expect("status channel closed")
}

#[tokio::test]
async fn test_webhook_posts_plain_text_row() {
    let server = mock_sheet().await;
    let webhook = SheetWebhook::new(Some(format!("{}/exec", server.uri())));
    let event = ticket();

    assert!(webhook.send(&SheetRow::from_event(&event)).await.unwrap());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();

    assert_eq!(body["type"], "ticket");
    assert_eq!(body["title"], "Support Ticket Logged");
    assert_eq!(body["details"]["client_name"], "Omar");
    let timestamp = body["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    assert!(timestamp.ends_with('Z'));
    assert_eq!(body.as_object().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unconfigured_webhook_is_noop() {
    let webhook = SheetWebhook::new(None);
    assert!(!webhook.is_configured());
    assert!(!webhook.send(&SheetRow::from_event(&ticket())).await.unwrap());

    // skipped without spawning
    webhook.post(&ticket());
}

#[tokio::test]
async fn test_webhook_failure_is_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // the response status is never inspected
    let webhook = SheetWebhook::new(Some(server.uri()));
    assert!(webhook.send(&SheetRow::from_event(&ticket())).await.unwrap());

    let unreachable = SheetWebhook::new(Some("http://127.0.0.1:9/exec".to_string()));
    assert!(unreachable.send(&SheetRow::from_event(&ticket())).await.is_err());
}

#[tokio::test]
async fn test_notifier_syncs_and_completes_actions() {
    let server = mock_sheet().await;
    let notifier = Notifier::new(&config(Some(format!("{}/exec", server.uri()))));
    let log = notifier.log();
    let mut updates = notifier.subscribe();

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(notifier.run(rx));

    let event = ticket();
    let id = event.id;
    tx.send(event).unwrap();

    let seen: Vec<ActionStatus> = [
        next_status(&mut updates).await,
        next_status(&mut updates).await,
        next_status(&mut updates).await,
    ]
    .iter()
    .map(|u| {
        assert_eq!(u.id, id);
        u.status
    })
    .collect();
    assert_eq!(
        seen,
        vec![ActionStatus::Pending, ActionStatus::Sending, ActionStatus::Success]
    );

    let requests = wait_for_requests(&server, 1).await;
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["type"], ActionKind::Ticket.as_str());

    {
        let log = log.read().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(&id).unwrap().status, ActionStatus::Success);
    }

    drop(tx);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("notifier should stop when the channel closes")
        .unwrap();
}

#[tokio::test]
async fn test_notifier_keeps_insertion_order() {
    let notifier = Notifier::new(&config(None));
    let log = notifier.log();
    let mut updates = notifier.subscribe();

    let first = ticket();
    let second = ticket();
    let ids = [first.id, second.id];

    notifier.intake(first).await;
    notifier.intake(second).await;

    let mut successes = 0;
    while successes < 2 {
        if next_status(&mut updates).await.status == ActionStatus::Success {
            successes += 1;
        }
    }

    let log = log.read().await;
    let order: Vec<_> = log.iter().map(|e| e.id).collect();
    assert_eq!(order, ids);
    assert!(log.iter().all(|e| e.status == ActionStatus::Success));
}
