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

//! In-process mock RTM service and shared test helpers.
//!
//! The mock speaks just enough of the PDU protocol for the client under test:
//! role/secret auth, publish/read/write/delete, subscribe with position and
//! history replay, and unsubscribe. Channel logs are shared across sessions
//! so a reconnecting client sees the same stream.
//!
//! Magic channels steer fault injection:
//! - publishing to `__drop__` slams the session shut;
//! - publishing to `__suberr__` pushes `rtm/subscription/error` to every
//!   subscription of the session.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use rtm_client::{
    ClientEvent, Pdu, RtmClient, SubscriptionEvent, auth::role_secret_hash,
};
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

pub const DROP_CHANNEL: &str = "__drop__";
pub const SUB_ERROR_CHANNEL: &str = "__suberr__";
pub const MOCK_NONCE: &str = "mock-nonce";

type ChannelLogs = Arc<Mutex<HashMap<String, Vec<Value>>>>;

#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Role/secret pair the mock validates `auth/authenticate` against.
    pub credentials: Option<(String, String)>,
    /// Reject every `rtm/subscribe` request.
    pub fail_subscribe: bool,
    /// Reject every `rtm/unsubscribe` request.
    pub fail_unsubscribe: bool,
}

pub struct MockServer {
    addr: SocketAddr,
    channels: ChannelLogs,
}

impl MockServer {
    pub async fn spawn(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let channels: ChannelLogs = Arc::new(Mutex::new(HashMap::new()));

        let session_channels = Arc::clone(&channels);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let options = options.clone();
                let channels = Arc::clone(&session_channels);
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        handle_session(ws, options, channels).await;
                    }
                });
            }
        });

        Self { addr, channels }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn channel_log(&self, channel: &str) -> Vec<Value> {
        self.channels
            .lock()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

async fn handle_session(
    mut ws: WebSocketStream<TcpStream>,
    options: ServerOptions,
    channels: ChannelLogs,
) {
    // subscription_id -> channel name
    let mut subs: HashMap<String, String> = HashMap::new();

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(pdu) = serde_json::from_str::<Pdu>(text.as_str()) else {
            continue;
        };
        let body = &pdu.body;

        match pdu.action.as_str() {
            "auth/handshake" => {
                reply(&mut ws, &pdu, "ok", json!({ "data": { "nonce": MOCK_NONCE } })).await;
            }
            "auth/authenticate" => {
                let presented = body
                    .get("credentials")
                    .and_then(|c| c.get("hash"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let accepted = match &options.credentials {
                    Some((_role, secret)) => {
                        presented == role_secret_hash(secret, MOCK_NONCE).unwrap()
                    }
                    None => true,
                };
                if accepted {
                    reply(&mut ws, &pdu, "ok", json!({})).await;
                } else {
                    reply(
                        &mut ws,
                        &pdu,
                        "error",
                        json!({ "error": "authentication_failed", "reason": "Unauthenticated" }),
                    )
                    .await;
                }
            }
            "rtm/publish" | "rtm/write" => {
                let channel = str_field(body, "channel");
                let message = body.get("message").cloned().unwrap_or(Value::Null);

                if channel == DROP_CHANNEL {
                    return;
                }
                if channel == SUB_ERROR_CHANNEL {
                    if pdu.id.is_some() {
                        reply(&mut ws, &pdu, "ok", json!({ "position": "0" })).await;
                    }
                    for sub_id in subs.keys() {
                        send_pdu(
                            &mut ws,
                            "rtm/subscription/error",
                            None,
                            json!({
                                "subscription_id": sub_id,
                                "error": "out_of_sync",
                                "reason": "simulated subscription fault",
                            }),
                        )
                        .await;
                    }
                    continue;
                }

                let position = {
                    let mut logs = channels.lock().await;
                    let entry = logs.entry(channel.clone()).or_default();
                    entry.push(message.clone());
                    entry.len().to_string()
                };
                if pdu.id.is_some() {
                    reply(&mut ws, &pdu, "ok", json!({ "position": &position })).await;
                }
                let receivers: Vec<String> = subs
                    .iter()
                    .filter(|(_, ch)| **ch == channel)
                    .map(|(sub_id, _)| sub_id.clone())
                    .collect();
                for sub_id in receivers {
                    send_pdu(
                        &mut ws,
                        "rtm/subscription/data",
                        None,
                        json!({
                            "subscription_id": sub_id,
                            "position": &position,
                            "messages": [&message],
                        }),
                    )
                    .await;
                }
            }
            "rtm/read" => {
                let channel = str_field(body, "channel");
                let latest = channels
                    .lock()
                    .await
                    .get(&channel)
                    .and_then(|log| log.last().cloned())
                    .unwrap_or(Value::Null);
                reply(&mut ws, &pdu, "ok", json!({ "message": latest })).await;
            }
            "rtm/delete" => {
                let channel = str_field(body, "channel");
                let position = {
                    let mut logs = channels.lock().await;
                    let entry = logs.entry(channel).or_default();
                    entry.clear();
                    "0".to_string()
                };
                if pdu.id.is_some() {
                    reply(&mut ws, &pdu, "ok", json!({ "position": position })).await;
                }
            }
            "rtm/subscribe" => {
                if options.fail_subscribe {
                    reply(
                        &mut ws,
                        &pdu,
                        "error",
                        json!({ "error": "subscribe_denied", "reason": "simulated rejection" }),
                    )
                    .await;
                    continue;
                }
                let sub_id = body
                    .get("subscription_id")
                    .or_else(|| body.get("channel"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                // Filters are not evaluated; a view streams its own channel
                let channel = str_field(body, "channel");
                let channel = if channel.is_empty() { sub_id.clone() } else { channel };

                let log = channels
                    .lock()
                    .await
                    .get(&channel)
                    .cloned()
                    .unwrap_or_default();
                let start = if let Some(position) = body.get("position").and_then(Value::as_str) {
                    position.parse::<usize>().unwrap_or(log.len()).min(log.len())
                } else if let Some(count) = body
                    .get("history")
                    .and_then(|h| h.get("count"))
                    .and_then(Value::as_u64)
                {
                    log.len().saturating_sub(count as usize)
                } else {
                    log.len()
                };

                reply(
                    &mut ws,
                    &pdu,
                    "ok",
                    json!({ "subscription_id": &sub_id, "position": log.len().to_string() }),
                )
                .await;
                for (offset, message) in log[start..].iter().enumerate() {
                    send_pdu(
                        &mut ws,
                        "rtm/subscription/data",
                        None,
                        json!({
                            "subscription_id": &sub_id,
                            "position": (start + offset + 1).to_string(),
                            "messages": [message],
                        }),
                    )
                    .await;
                }
                subs.insert(sub_id, channel);
            }
            "rtm/unsubscribe" => {
                if options.fail_unsubscribe {
                    reply(
                        &mut ws,
                        &pdu,
                        "error",
                        json!({ "error": "unsubscribe_denied", "reason": "simulated rejection" }),
                    )
                    .await;
                    continue;
                }
                let sub_id = str_field(body, "subscription_id");
                subs.remove(&sub_id);
                reply(&mut ws, &pdu, "ok", json!({ "subscription_id": sub_id })).await;
            }
            other => {
                if pdu.id.is_some() {
                    reply(
                        &mut ws,
                        &pdu,
                        "error",
                        json!({ "error": "unknown_action", "reason": other }),
                    )
                    .await;
                }
            }
        }
    }
}

fn str_field(body: &Value, field: &str) -> String {
    body.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, request: &Pdu, outcome: &str, body: Value) {
    let action = format!("{}/{outcome}", request.action);
    send_pdu(ws, &action, request.id.clone(), body).await;
}

async fn send_pdu(
    ws: &mut WebSocketStream<TcpStream>,
    action: &str,
    id: Option<String>,
    body: Value,
) {
    let pdu = Pdu::new(action, id, body);
    let text = serde_json::to_string(&pdu).unwrap();
    let _ = ws.send(Message::Text(text.into())).await;
}

////////////////////////////////////////////////////////////////////////////////
// Client-side helpers
////////////////////////////////////////////////////////////////////////////////

pub type EventLog<E> = Arc<StdMutex<Vec<E>>>;

pub fn record_client_events(client: &RtmClient) -> EventLog<ClientEvent> {
    let log: EventLog<ClientEvent> = Arc::default();
    let sink = Arc::clone(&log);
    client.on_client_event(move |event| sink.lock().unwrap().push(event.clone()));
    log
}

pub fn record_subscription_events(client: &RtmClient) -> EventLog<SubscriptionEvent> {
    let log: EventLog<SubscriptionEvent> = Arc::default();
    let sink = Arc::clone(&log);
    client.on_subscription_event(move |event| sink.lock().unwrap().push(event.clone()));
    log
}

/// Polls `predicate` until it holds, panicking after five seconds.
pub async fn wait_until(description: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
