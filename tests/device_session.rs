//! Integration tests for the device session against the simulated device
//!
//! These tests drive a `DeviceSession` over the mock firmware link and check
//! connection lifecycle, transcript contents and the one-shot reconnect.

use prodline::device::{ConnectionState, DeviceSession, Direction, SessionConfig};
use prodline::error::ProdlineError;
use prodline::hardware::mock::{MockBehavior, MockChooser, MockDevice};
use std::sync::Arc;
use std::time::Duration;

fn session_for(device: &MockDevice) -> DeviceSession {
    DeviceSession::new(
        Arc::new(MockChooser::granting(device.clone())),
        SessionConfig {
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        },
    )
}

async fn connected(device: &MockDevice) -> DeviceSession {
    let session = session_for(device);
    session.request_access().await.unwrap();
    session.connect().await.unwrap();
    session
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_and_exchange() {
    let device = MockDevice::new();
    let session = connected(&device).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.device_name().await.as_deref(), Some("mock-labeler"));

    let since = session.log().cursor();
    assert!(session.send("3").await.unwrap());

    let hit = session
        .wait_for_signal("2", since, Some(Duration::from_secs(2)), None)
        .await
        .unwrap();
    assert_eq!(hit.direction, Direction::Received);
    assert_eq!(device.commands(), vec!["3"]);

    let sent: Vec<String> = session
        .log()
        .entries()
        .into_iter()
        .filter(|e| e.direction == Direction::Sent)
        .map(|e| e.text)
        .collect();
    assert_eq!(sent, vec!["3"]);
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let device = MockDevice::new();
    let session = session_for(&device);
    let mut states = session.watch_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    session.request_access().await.unwrap();
    session.connect().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    session.disconnect().await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_keeps_single_link() {
    let device = MockDevice::new();
    let session = connected(&device).await;
    session.connect().await.unwrap();
    assert_eq!(device.open_count(), 1);
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let device = MockDevice::new();
    device.set_fail_open(true);
    let session = session_for(&device);
    session.request_access().await.unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, ProdlineError::DeviceIo(_)));
    assert_eq!(session.state(), ConnectionState::Failed);

    device.set_fail_open(false);
    session.connect().await.unwrap();
    assert!(session.is_connected());
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn test_dropped_link_reconnects_once() {
    let device = MockDevice::new();
    let session = connected(&device).await;

    device.drop_link().await;
    wait_until(|| device.open_count() == 2 && session.is_connected()).await;

    let statuses: Vec<String> = session
        .log()
        .entries()
        .into_iter()
        .filter(|e| e.direction == Direction::Status)
        .map(|e| e.text)
        .collect();
    assert!(statuses.iter().any(|s| s.starts_with("Read loop stopped")));
    assert!(statuses.iter().any(|s| s.starts_with("Reconnected")));

    // The reopened link carries traffic.
    let since = session.log().cursor();
    assert!(session.send("4").await.unwrap());
    session
        .wait_for_signal("1", since, Some(Duration::from_secs(2)), None)
        .await
        .unwrap();

    // The reconnect budget is spent; a second drop leaves the session failed.
    device.drop_link().await;
    wait_until(|| session.state() == ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.open_count(), 2);
    assert!(!session.send("4").await.unwrap());
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    let device = MockDevice::new();
    let session = DeviceSession::new(
        Arc::new(MockChooser::granting(device.clone())),
        SessionConfig {
            reconnect_on_read_error: false,
            ..Default::default()
        },
    );
    session.request_access().await.unwrap();
    session.connect().await.unwrap();

    device.drop_link().await;
    wait_until(|| session.state() == ConnectionState::Failed).await;
    assert_eq!(device.open_count(), 1);
}

#[tokio::test]
async fn test_unsolicited_lines_are_logged() {
    let device = MockDevice::with_behavior(MockBehavior {
        noise: Some("E7".into()),
        ..Default::default()
    });
    let session = connected(&device).await;

    device.inject("BOOT").await.unwrap();
    let since = session.log().cursor();
    session.send("4").await.unwrap();
    session
        .wait_for_signal("1", since, Some(Duration::from_secs(2)), None)
        .await
        .unwrap();

    let received: Vec<String> = session
        .log()
        .entries()
        .into_iter()
        .filter(|e| e.direction == Direction::Received)
        .map(|e| e.text)
        .collect();
    assert_eq!(received, vec!["BOOT", "E7", "1"]);
}
