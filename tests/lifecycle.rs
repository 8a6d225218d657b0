// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Connection lifecycle integration tests against the in-process mock
//! service.

mod common;

use std::{sync::Arc, time::Duration};

use common::{
    DROP_CHANNEL, MockServer, ServerOptions, record_client_events, wait_until,
};
use rtm_client::{
    Ack, ClientEvent, ClientStateKind, RoleAuthenticator, RoleCredential, RtmClient,
    RtmClientBuilder, RtmError,
};
use serde_json::json;

fn fast_builder(endpoint: &str) -> RtmClientBuilder {
    RtmClientBuilder::new(endpoint, "TESTKEY")
        .min_reconnect_interval(Duration::from_millis(10))
        .max_reconnect_interval(Duration::from_millis(100))
}

fn kinds(events: &[ClientEvent]) -> Vec<String> {
    events.iter().map(|event| format!("{event:?}")).collect()
}

fn count_entered(events: &[ClientEvent], kind: ClientStateKind) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ClientEvent::Enter(k) if *k == kind))
        .count()
}

async fn wait_for_state(log: &common::EventLog<ClientEvent>, kind: ClientStateKind) {
    wait_until(&format!("client entered {kind:?}"), || {
        count_entered(&log.lock().unwrap(), kind) > 0
    })
    .await;
}

#[tokio::test]
async fn test_start_stop_event_sequence() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;
    client.stop().unwrap();
    wait_for_state(&events, ClientStateKind::Stopped).await;

    let seen = kinds(&events.lock().unwrap());
    assert_eq!(
        seen,
        vec![
            "Enter(Connecting)",
            "Leave(Connecting)",
            "Enter(Connected)",
            "Leave(Connected)",
            "Enter(Stopped)",
        ]
    );
    client.dispose().await;
}

#[tokio::test]
async fn test_rapid_start_stop_pairs_leave_enter_in_order() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);

    // All four commands land before any connect attempt resolves, so the
    // stale outcomes must be discarded and the event stream stays paired.
    client.start().unwrap();
    client.stop().unwrap();
    client.start().unwrap();
    client.stop().unwrap();

    wait_until("both stop transitions observed", || {
        count_entered(&events.lock().unwrap(), ClientStateKind::Stopped) == 2
    })
    .await;
    // Give any stale connect outcome a chance to misbehave
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = kinds(&events.lock().unwrap());
    assert_eq!(
        seen,
        vec![
            "Enter(Connecting)",
            "Leave(Connecting)",
            "Enter(Stopped)",
            "Leave(Stopped)",
            "Enter(Connecting)",
            "Leave(Connecting)",
            "Enter(Stopped)",
        ]
    );
    client.dispose().await;
}

#[tokio::test]
async fn test_restart_reconnects() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;
    client.restart().unwrap();
    wait_until("reconnected after restart", || {
        count_entered(&events.lock().unwrap(), ClientStateKind::Connected) == 2
    })
    .await;

    client.dispose().await;
}

#[tokio::test]
async fn test_auth_success_reaches_connected_without_errors() {
    let server = MockServer::spawn(ServerOptions {
        credentials: Some(("superuser".to_string(), "s3cr3t".to_string())),
        ..Default::default()
    })
    .await;
    let client = fast_builder(&server.endpoint())
        .authenticator(Arc::new(RoleAuthenticator::new(RoleCredential::new(
            "superuser", "s3cr3t",
        ))))
        .build()
        .unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;

    let has_error = events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(_)));
    assert!(!has_error);
    client.dispose().await;
}

#[tokio::test]
async fn test_auth_bad_secret_fails_the_attempt() {
    let server = MockServer::spawn(ServerOptions {
        credentials: Some(("superuser".to_string(), "s3cr3t".to_string())),
        ..Default::default()
    })
    .await;
    let client = fast_builder(&server.endpoint())
        .max_reconnect_interval(Duration::from_secs(30))
        .min_reconnect_interval(Duration::from_secs(30))
        .authenticator(Arc::new(RoleAuthenticator::new(RoleCredential::new(
            "superuser", "wrong",
        ))))
        .build()
        .unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Awaiting).await;

    let auth_errors = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, ClientEvent::Error(RtmError::Auth(_))))
        .count();
    assert_eq!(auth_errors, 1);
    assert_eq!(
        count_entered(&events.lock().unwrap(), ClientStateKind::Connected),
        0
    );
    client.dispose().await;
}

#[tokio::test]
async fn test_offline_queue_drains_fifo_and_overflows_hard() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint())
        .offline_queue_capacity(2)
        .build()
        .unwrap();

    let waiter = |client: &RtmClient| {
        let client = client.clone();
        tokio::spawn(async move { client.get_connection().await })
    };
    let first = waiter(&client);
    let second = waiter(&client);
    // Let both waiters enqueue before probing the overflow
    tokio::time::sleep(Duration::from_millis(50)).await;
    let overflow = client.get_connection().await;
    assert!(matches!(overflow, Err(RtmError::QueueFull)));

    client.start().unwrap();
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    client.dispose().await;
}

#[tokio::test]
async fn test_zero_capacity_queue_rejects_while_disconnected() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint())
        .offline_queue_capacity(0)
        .build()
        .unwrap();

    assert!(matches!(
        client.get_connection().await,
        Err(RtmError::QueueFull)
    ));

    let events = record_client_events(&client);
    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;
    assert!(client.get_connection().await.is_ok());
    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_fails_waiters_and_rejects_commands() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.dispose().await;
    assert!(matches!(waiter.await.unwrap(), Err(RtmError::Disposed)));
    assert!(matches!(client.start(), Err(RtmError::Disposed)));
    assert!(matches!(
        client.get_connection().await,
        Err(RtmError::Disposed)
    ));

    // Dispose again is a no-op
    client.dispose().await;

    wait_until("disposed event observed", || {
        count_entered(&events.lock().unwrap(), ClientStateKind::Disposed) == 1
    })
    .await;
}

#[tokio::test]
async fn test_dropped_connection_backs_off_and_reconnects() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;

    client
        .publish(DROP_CHANNEL, json!("bye"), Ack::No)
        .await
        .unwrap();

    wait_until("reconnected after drop", || {
        count_entered(&events.lock().unwrap(), ClientStateKind::Connected) == 2
    })
    .await;

    let seen = events.lock().unwrap();
    assert!(count_entered(&seen, ClientStateKind::Awaiting) >= 1);
    assert!(seen
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(RtmError::Disconnected))));
    drop(seen);
    client.dispose().await;
}

#[tokio::test]
async fn test_unreachable_endpoint_schedules_retries() {
    // Port 9 is discard; nothing accepts WebSocket connections there
    let client = fast_builder("ws://127.0.0.1:9").build().unwrap();
    let events = record_client_events(&client);

    client.start().unwrap();
    wait_until("at least two attempts failed", || {
        count_entered(&events.lock().unwrap(), ClientStateKind::Awaiting) >= 2
    })
    .await;

    let errors = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, ClientEvent::Error(RtmError::Transport(_))))
        .count();
    assert!(errors >= 2);
    client.dispose().await;
}

#[tokio::test]
async fn test_read_write_delete_roundtrip() {
    let server = MockServer::spawn(ServerOptions::default()).await;
    let client = fast_builder(&server.endpoint()).build().unwrap();
    let events = record_client_events(&client);
    client.start().unwrap();
    wait_for_state(&events, ClientStateKind::Connected).await;

    assert_eq!(client.read("kv").await.unwrap(), None);

    let position = client
        .write("kv", json!({"answer": 42}), Ack::Yes)
        .await
        .unwrap();
    assert!(position.is_some());
    assert_eq!(client.read("kv").await.unwrap(), Some(json!({"answer": 42})));

    client.delete("kv", Ack::Yes).await.unwrap();
    assert_eq!(client.read("kv").await.unwrap(), None);

    // Fire-and-forget publish still lands; the follow-up read is ordered
    // behind it on the same connection
    client.publish("kv", json!("latest"), Ack::No).await.unwrap();
    assert_eq!(client.read("kv").await.unwrap(), Some(json!("latest")));

    client.dispose().await;
}
