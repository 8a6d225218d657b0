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

//! Public client handle and builder.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::{
    auth::Authenticator,
    connection::{Connection, Connector, WsConnector},
    consts::{
        ACTION_DELETE, ACTION_PUBLISH, ACTION_READ, ACTION_WRITE,
        DEFAULT_MAX_RECONNECT_INTERVAL_MS, DEFAULT_MIN_RECONNECT_INTERVAL_MS,
        DEFAULT_OFFLINE_QUEUE_CAPACITY, RTM_VERSION,
    },
    dispatcher::Dispatcher,
    error::{RtmError, RtmResult},
    events::{
        self, ClientEvent, ObserverId, SharedObservers, SubscriptionEvent, new_observers,
    },
    handler::{ClientCommand, CoreHandler, CoreOptions},
    subscription::{SubscriptionConfig, SubscriptionSnapshot},
};

/// Whether a channel operation waits for the service acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Yes,
    No,
}

/// Builder for [`RtmClient`].
///
/// ```ignore
/// let client = RtmClientBuilder::new("wss://example.api.satori.com", "APPKEY")
///     .min_reconnect_interval(Duration::from_secs(1))
///     .build()?;
/// client.start()?;
/// ```
pub struct RtmClientBuilder {
    endpoint: String,
    appkey: String,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
    offline_queue_capacity: usize,
    authenticator: Option<Arc<dyn Authenticator>>,
    connector: Option<Arc<dyn Connector>>,
    dispatcher: Option<Dispatcher>,
    proxy: Option<String>,
}

impl RtmClientBuilder {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, appkey: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            appkey: appkey.into(),
            min_reconnect_interval: Duration::from_millis(DEFAULT_MIN_RECONNECT_INTERVAL_MS),
            max_reconnect_interval: Duration::from_millis(DEFAULT_MAX_RECONNECT_INTERVAL_MS),
            offline_queue_capacity: DEFAULT_OFFLINE_QUEUE_CAPACITY,
            authenticator: None,
            connector: None,
            dispatcher: None,
            proxy: None,
        }
    }

    /// Lower bound of the reconnect backoff (also bounds its jitter).
    #[must_use]
    pub const fn min_reconnect_interval(mut self, interval: Duration) -> Self {
        self.min_reconnect_interval = interval;
        self
    }

    /// Upper bound of the reconnect backoff.
    #[must_use]
    pub const fn max_reconnect_interval(mut self, interval: Duration) -> Self {
        self.max_reconnect_interval = interval;
        self
    }

    /// Capacity of the offline queue; zero rejects callers immediately while
    /// disconnected.
    #[must_use]
    pub const fn offline_queue_capacity(mut self, capacity: usize) -> Self {
        self.offline_queue_capacity = capacity;
        self
    }

    /// Authenticator run on every freshly opened connection.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Replaces the default transport connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the default callback dispatcher, e.g. to share one across
    /// several clients.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// HTTP CONNECT proxy (`host:port`) for the default connector.
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Builds the client and spawns its core task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is not a WebSocket URL.
    pub fn build(self) -> RtmResult<RtmClient> {
        let url = build_url(&self.endpoint, &self.appkey)?;
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector::new(self.proxy)),
        };
        let dispatcher = self.dispatcher.unwrap_or_else(Dispatcher::start);

        let client_observers = new_observers();
        let sub_observers = new_observers();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let core = CoreHandler::new(
            CoreOptions {
                url,
                connector,
                authenticator: self.authenticator,
                min_reconnect_interval: self.min_reconnect_interval,
                max_reconnect_interval: self.max_reconnect_interval,
                offline_queue_capacity: self.offline_queue_capacity,
            },
            cmd_rx,
            dispatcher,
            Arc::clone(&client_observers),
            Arc::clone(&sub_observers),
        );
        tokio::spawn(core.run());

        Ok(RtmClient {
            cmd_tx,
            client_observers,
            sub_observers,
        })
    }
}

fn build_url(endpoint: &str, appkey: &str) -> RtmResult<String> {
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(RtmError::InvalidOperation(format!(
            "endpoint must be a ws:// or wss:// URL, got `{endpoint}`"
        )));
    }
    let trimmed = endpoint.trim_end_matches('/');
    let versioned = if trimmed.ends_with(&format!("/{RTM_VERSION}")) {
        trimmed.to_string()
    } else {
        format!("{trimmed}/{RTM_VERSION}")
    };
    Ok(format!("{versioned}?appkey={appkey}"))
}

/// Cloneable handle to a running client.
///
/// All handles drive the same core task; dropping the last one disposes the
/// client.
#[derive(Clone)]
pub struct RtmClient {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    client_observers: SharedObservers<ClientEvent>,
    sub_observers: SharedObservers<SubscriptionEvent>,
}

impl RtmClient {
    ////////////////////////////////////////////////////////////////////////////
    // Lifecycle
    ////////////////////////////////////////////////////////////////////////////

    /// Starts connecting; a no-op unless Uninitialized or Stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub fn start(&self) -> RtmResult<()> {
        self.send(ClientCommand::Start)
    }

    /// Stops the client, cancelling any connect attempt or reconnect timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub fn stop(&self) -> RtmResult<()> {
        self.send(ClientCommand::Stop)
    }

    /// Equivalent to `stop` immediately followed by `start`, with no command
    /// interleaving in between.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub fn restart(&self) -> RtmResult<()> {
        self.send(ClientCommand::Restart)
    }

    /// Disposes the client: tears down the connection and every
    /// subscription, fails queued waiters, and detaches all observers.
    ///
    /// Resolves once the core task has fully shut down. Idempotent.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCommand::Dispose(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Connection access
    ////////////////////////////////////////////////////////////////////////////

    /// Returns the live connection, waiting in the offline queue while
    /// disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`RtmError::QueueFull`] when the offline queue is at capacity,
    /// [`RtmError::Disposed`] after disposal, and [`RtmError::Disconnected`]
    /// if the wait is abandoned.
    pub async fn get_connection(&self) -> RtmResult<Arc<Connection>> {
        let (tx, rx) = oneshot::channel();
        self.send(ClientCommand::GetConnection(tx))?;
        rx.await.map_err(|_| RtmError::Disposed)?
    }

    ////////////////////////////////////////////////////////////////////////////
    // Channel operations
    ////////////////////////////////////////////////////////////////////////////

    /// Publishes a message, returning the stream position when acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available or the service rejects
    /// the publish.
    pub async fn publish(&self, channel: &str, message: Value, ack: Ack) -> RtmResult<Option<String>> {
        self.channel_op(ACTION_PUBLISH, json!({ "channel": channel, "message": message }), ack)
            .await
    }

    /// Reads the latest message from a channel, `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available or the service rejects
    /// the read.
    pub async fn read(&self, channel: &str) -> RtmResult<Option<Value>> {
        let connection = self.get_connection().await?;
        let reply = connection
            .send_request(ACTION_READ, json!({ "channel": channel }))
            .await?;
        let message = reply.body.get("message").cloned();
        Ok(message.filter(|value| !value.is_null()))
    }

    /// Overwrites the channel's latest value.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available or the service rejects
    /// the write.
    pub async fn write(&self, channel: &str, value: Value, ack: Ack) -> RtmResult<Option<String>> {
        self.channel_op(ACTION_WRITE, json!({ "channel": channel, "message": value }), ack)
            .await
    }

    /// Deletes the channel's latest value.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available or the service rejects
    /// the delete.
    pub async fn delete(&self, channel: &str, ack: Ack) -> RtmResult<Option<String>> {
        self.channel_op(ACTION_DELETE, json!({ "channel": channel }), ack)
            .await
    }

    async fn channel_op(&self, action: &str, body: Value, ack: Ack) -> RtmResult<Option<String>> {
        let connection = self.get_connection().await?;
        match ack {
            Ack::Yes => {
                let reply = connection.send_request(action, body).await?;
                Ok(reply
                    .body
                    .get("position")
                    .and_then(Value::as_str)
                    .map(str::to_string))
            }
            Ack::No => {
                connection.send_no_ack(action, body).await?;
                Ok(None)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Subscriptions
    ////////////////////////////////////////////////////////////////////////////

    /// Creates (or reconfigures) the subscription with the given id.
    ///
    /// Reconfiguring a live subscription unwinds the current incarnation
    /// first; the new config takes over once the old one is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn create_subscription(
        &self,
        subscription_id: impl Into<String>,
        config: SubscriptionConfig,
    ) -> RtmResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ClientCommand::CreateSubscription {
            id: subscription_id.into(),
            config,
            reply: tx,
        })?;
        rx.await.map_err(|_| RtmError::Disposed)?
    }

    /// Removes the subscription with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`RtmError::InvalidOperation`] for an unknown id, or an error
    /// if the client has been disposed.
    pub async fn remove_subscription(&self, subscription_id: &str) -> RtmResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ClientCommand::RemoveSubscription {
            id: subscription_id.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| RtmError::Disposed)?
    }

    /// Returns a snapshot of the subscription, `None` for an unknown id.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> RtmResult<Option<SubscriptionSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send(ClientCommand::GetSubscription {
            id: subscription_id.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| RtmError::Disposed)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Observers
    ////////////////////////////////////////////////////////////////////////////

    /// Registers an observer for client lifecycle events.
    pub fn on_client_event<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        events::add_observer(&self.client_observers, Arc::new(callback))
    }

    /// Detaches a client event observer.
    pub fn remove_client_observer(&self, id: ObserverId) -> bool {
        events::remove_observer(&self.client_observers, id)
    }

    /// Registers an observer for subscription events.
    pub fn on_subscription_event<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        events::add_observer(&self.sub_observers, Arc::new(callback))
    }

    /// Detaches a subscription event observer.
    pub fn remove_subscription_observer(&self, id: ObserverId) -> bool {
        events::remove_observer(&self.sub_observers, id)
    }

    fn send(&self, cmd: ClientCommand) -> RtmResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| RtmError::Disposed)
    }
}
