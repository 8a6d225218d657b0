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

//! Multiplexed request/reply transport over one WebSocket session.
//!
//! A [`Connection`] owns the split read and write halves of the socket and a
//! pending-operation table keyed by correlation id. Any number of callers may
//! issue [`Connection::send_request`] concurrently; exactly one logical reader
//! loop pumps [`Connection::do_step`] and resolves replies into the table.

use std::{
    sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, oneshot},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, client_async_tls_with_config, connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

use crate::{
    consts::GRACEFUL_CLOSE_TIMEOUT_SECS,
    error::{RtmError, RtmResult},
    pdu::{Pdu, PduErrorBody, ReplyOutcome},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Result of reading and classifying one inbound frame.
#[derive(Debug)]
pub enum Step {
    /// A correlated reply was resolved into the pending table.
    ReplyDelivered,
    /// A reply arrived with an id no pending entry matches.
    UnexpectedReply(Pdu),
    /// An unsolicited PDU with no correlation id.
    Unsolicited(Pdu),
    /// The socket closed or errored; the connection is now disposed.
    Disconnected,
}

#[derive(Debug)]
struct PendingEntry {
    action: String,
    reply_tx: oneshot::Sender<RtmResult<Pdu>>,
}

/// One live WebSocket session with request/reply correlation.
pub struct Connection {
    writer: Mutex<WsWriter>,
    reader: Mutex<WsReader>,
    pending: StdMutex<AHashMap<String, PendingEntry>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Connection))
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub(crate) fn new(stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            pending: StdMutex::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    /// Sends a request and awaits its correlated reply.
    ///
    /// A negative reply resolves to [`RtmError::Pdu`]; a reply whose action is
    /// neither the positive nor negative form resolves to
    /// [`RtmError::UnknownOutcome`]. A local write failure removes the pending
    /// entry and surfaces the error without retrying.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is disposed, the write fails, the
    /// reply is negative, or the connection drops before the reply arrives.
    pub async fn send_request(&self, action: &str, body: Value) -> RtmResult<Pdu> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RtmError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            pending.insert(
                id.clone(),
                PendingEntry {
                    action: action.to_string(),
                    reply_tx,
                },
            );
        }

        let pdu = Pdu::new(action, Some(id.clone()), body);
        if let Err(error) = self.write_frame(&pdu).await {
            lock_pending(&self.pending).remove(&id);
            return Err(error);
        }

        // Disposal between the write and this await still resolves the entry.
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(RtmError::Disconnected),
        }
    }

    /// Sends a fire-and-forget request: no id, no reply, no pending entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is disposed or the write fails.
    pub async fn send_no_ack(&self, action: &str, body: Value) -> RtmResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RtmError::Disconnected);
        }
        self.write_frame(&Pdu::new(action, None, body)).await
    }

    async fn write_frame(&self, pdu: &Pdu) -> RtmResult<()> {
        let text = serde_json::to_string(pdu).map_err(|e| RtmError::Encoding(e.to_string()))?;
        log::trace!("SEND: {text}");
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Reads one meaningful frame and classifies it.
    ///
    /// Control frames and non-text payloads are skipped internally. A matched
    /// reply is resolved into the pending table before this returns.
    pub async fn do_step(&self) -> Step {
        loop {
            let frame = {
                let mut reader = self.reader.lock().await;
                reader.next().await
            };
            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    log::debug!("WebSocket read failed: {e}");
                    self.dispose();
                    return Step::Disconnected;
                }
                None => {
                    self.dispose();
                    return Step::Disconnected;
                }
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    log::debug!("Close frame received: {frame:?}");
                    self.dispose();
                    return Step::Disconnected;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => {
                    log::trace!("Skipping non-text frame: {other:?}");
                    continue;
                }
            };
            log::trace!("RECV: {text}");

            let pdu: Pdu = match serde_json::from_str(text.as_str()) {
                Ok(pdu) => pdu,
                Err(e) => {
                    log::warn!("Discarding malformed PDU: {e}");
                    continue;
                }
            };

            let Some(id) = pdu.id.clone() else {
                return Step::Unsolicited(pdu);
            };
            let entry = lock_pending(&self.pending).remove(&id);
            return match entry {
                Some(entry) => {
                    resolve_reply(entry, pdu);
                    Step::ReplyDelivered
                }
                None => Step::UnexpectedReply(pdu),
            };
        }
    }

    /// Attempts a graceful close handshake, then disposes.
    pub async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            let timeout = Duration::from_secs(GRACEFUL_CLOSE_TIMEOUT_SECS);
            if tokio::time::timeout(timeout, writer.close()).await.is_err() {
                log::debug!("Graceful close timed out, dropping the socket");
            }
        }
        self.dispose();
    }

    /// Force-resolves every pending entry with a Disconnected outcome.
    ///
    /// Idempotent; subsequent sends are rejected immediately.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<PendingEntry> = {
            let mut pending = lock_pending(&self.pending);
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            log::debug!("Failing {} pending operations on disposal", drained.len());
        }
        for entry in drained {
            let _ = entry.reply_tx.send(Err(RtmError::Disconnected));
        }
    }

    /// Returns whether the connection has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

fn lock_pending(
    pending: &StdMutex<AHashMap<String, PendingEntry>>,
) -> std::sync::MutexGuard<'_, AHashMap<String, PendingEntry>> {
    // Entries are plain senders, no invariant survives a panicking holder.
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn resolve_reply(entry: PendingEntry, pdu: Pdu) {
    let result = match pdu.reply_outcome(&entry.action) {
        ReplyOutcome::Positive => Ok(pdu),
        ReplyOutcome::Negative => {
            let body = PduErrorBody::from_value(&pdu.body);
            Err(RtmError::Pdu {
                code: body.code,
                reason: body.reason,
            })
        }
        ReplyOutcome::Unknown => Err(RtmError::UnknownOutcome(pdu.action)),
    };
    if entry.reply_tx.send(result).is_err() {
        log::trace!("Reply arrived after the caller went away");
    }
}

/// Opens the transport connection for a connect attempt.
///
/// Overridable via [`crate::RtmClientBuilder::connector`] so tests and apps
/// can substitute their own transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a connection to `url`, aborting promptly when `cancel`
    /// fires.
    async fn connect(&self, url: &str, cancel: &CancellationToken) -> RtmResult<Connection>;
}

/// Default connector: direct `tokio-tungstenite` dial, optionally tunnelled
/// through an HTTP CONNECT proxy.
#[derive(Debug, Default)]
pub struct WsConnector {
    proxy: Option<String>,
}

impl WsConnector {
    #[must_use]
    pub const fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }

    async fn open(&self, url: &str) -> RtmResult<Connection> {
        let stream = match &self.proxy {
            None => {
                let (stream, _response) = connect_async(url).await?;
                stream
            }
            Some(proxy) => open_via_proxy(url, proxy).await?,
        };
        Ok(Connection::new(stream))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, cancel: &CancellationToken) -> RtmResult<Connection> {
        tokio::select! {
            () = cancel.cancelled() => Err(RtmError::Transport("connection attempt cancelled".to_string())),
            result = self.open(url) => result,
        }
    }
}

async fn open_via_proxy(url: &str, proxy: &str) -> RtmResult<WsStream> {
    let request = url.into_client_request()?;
    let uri = request.uri().clone();
    let scheme = uri.scheme_str().unwrap_or("ws");
    let host = uri
        .host()
        .ok_or_else(|| RtmError::Transport("endpoint URL is missing a host".to_string()))?
        .to_string();
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == "wss" { 443 } else { 80 });

    let proxy_addr = proxy.strip_prefix("http://").unwrap_or(proxy);
    let mut stream = TcpStream::connect(proxy_addr)
        .await
        .map_err(|e| RtmError::Transport(format!("proxy connect to {proxy_addr} failed: {e}")))?;

    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|e| RtmError::Transport(format!("proxy CONNECT write failed: {e}")))?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| RtmError::Transport(format!("proxy CONNECT read failed: {e}")))?;
        if n == 0 {
            return Err(RtmError::Transport(
                "proxy closed the tunnel during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.len() > 8192 {
            return Err(RtmError::Transport(
                "oversized proxy CONNECT response".to_string(),
            ));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    if !(status_line.starts_with("HTTP/1.1 200") || status_line.starts_with("HTTP/1.0 200")) {
        return Err(RtmError::Transport(format!(
            "proxy CONNECT rejected: {status_line}"
        )));
    }

    let (stream, _response) = client_async_tls_with_config(request, stream, None, None).await?;
    Ok(stream)
}
