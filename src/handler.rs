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

//! Core task owning the client connection FSM, the subscription registry, and
//! the offline queue.
//!
//! All mutable state lives on this one task; the public handle talks to it
//! over an unbounded command channel, and background work (connect attempts,
//! the socket reader, reconnect timers, in-flight subscribe/unsubscribe
//! requests) reports back over an internal event channel. Results from a
//! superseded incarnation are discarded by comparing the attempt generation
//! (client) or epoch (subscription) they were spawned under.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::Authenticator,
    backoff::ReconnectBackoff,
    connection::{Connection, Connector, Step},
    consts::{
        ACTION_CORE_ERROR, ACTION_SUBSCRIBE, ACTION_SUBSCRIPTION_DATA, ACTION_SUBSCRIPTION_ERROR,
        ACTION_SUBSCRIPTION_INFO, ACTION_UNSUBSCRIBE,
    },
    dispatcher::Dispatcher,
    error::{RtmError, RtmResult},
    events::{
        self, ClientEvent, ClientStateKind, SharedObservers, SubscriptionEvent,
    },
    pdu::{Pdu, PduErrorBody},
    queue::{ConnectionWaiter, OfflineQueue},
    subscription::{Subscription, SubscriptionConfig, SubscriptionSnapshot, SubscriptionStateKind},
};

/// Commands accepted by the core task.
pub(crate) enum ClientCommand {
    Start,
    Stop,
    Restart,
    Dispose(oneshot::Sender<()>),
    GetConnection(ConnectionWaiter),
    CreateSubscription {
        id: String,
        config: SubscriptionConfig,
        reply: oneshot::Sender<RtmResult<()>>,
    },
    RemoveSubscription {
        id: String,
        reply: oneshot::Sender<RtmResult<()>>,
    },
    GetSubscription {
        id: String,
        reply: oneshot::Sender<Option<SubscriptionSnapshot>>,
    },
}

/// Completions reported by background tasks.
enum InternalEvent {
    ConnectOutcome {
        generation: u64,
        result: RtmResult<Arc<Connection>>,
    },
    SocketClosed {
        generation: u64,
    },
    Unsolicited {
        generation: u64,
        pdu: Pdu,
    },
    ReconnectTimerFired {
        generation: u64,
    },
    SubscribeOutcome {
        id: String,
        epoch: u64,
        result: RtmResult<Pdu>,
    },
    UnsubscribeOutcome {
        id: String,
        epoch: u64,
        result: RtmResult<Pdu>,
    },
}

/// Current state of the connection FSM.
enum ClientState {
    Uninitialized,
    Stopped,
    Connecting,
    Connected(Arc<Connection>),
    Awaiting,
    Disposed,
}

impl ClientState {
    const fn kind(&self) -> ClientStateKind {
        match self {
            Self::Uninitialized => ClientStateKind::Uninitialized,
            Self::Stopped => ClientStateKind::Stopped,
            Self::Connecting => ClientStateKind::Connecting,
            Self::Connected(_) => ClientStateKind::Connected,
            Self::Awaiting => ClientStateKind::Awaiting,
            Self::Disposed => ClientStateKind::Disposed,
        }
    }
}

/// Fixed configuration handed to the core task at build time.
pub(crate) struct CoreOptions {
    pub url: String,
    pub connector: Arc<dyn Connector>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub min_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub offline_queue_capacity: usize,
}

pub(crate) struct CoreHandler {
    options: CoreOptions,
    state: ClientState,
    /// Bumped on every transition; background results carrying an older
    /// generation are stale.
    generation: u64,
    cancel: Option<CancellationToken>,
    backoff: ReconnectBackoff,
    registry: AHashMap<String, Subscription>,
    offline_queue: OfflineQueue,
    dispatcher: Dispatcher,
    client_observers: SharedObservers<ClientEvent>,
    sub_observers: SharedObservers<SubscriptionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    read_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl CoreHandler {
    pub(crate) fn new(
        options: CoreOptions,
        cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
        dispatcher: Dispatcher,
        client_observers: SharedObservers<ClientEvent>,
        sub_observers: SharedObservers<SubscriptionEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let backoff = ReconnectBackoff::new(
            options.min_reconnect_interval,
            options.max_reconnect_interval,
        );
        let offline_queue = OfflineQueue::new(options.offline_queue_capacity);
        Self {
            options,
            state: ClientState::Uninitialized,
            generation: 0,
            cancel: None,
            backoff,
            registry: AHashMap::new(),
            offline_queue,
            dispatcher,
            client_observers,
            sub_observers,
            cmd_rx,
            internal_tx,
            internal_rx,
            read_task: None,
            timer_task: None,
        }
    }

    pub(crate) async fn run(mut self) {
        log::debug!("Core task started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ClientCommand::Dispose(ack)) => {
                        self.dispose();
                        let _ = ack.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle dropped
                        self.dispose();
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
            }
        }
        log::debug!("Core task stopped");
    }

    ////////////////////////////////////////////////////////////////////////////
    // Command handling
    ////////////////////////////////////////////////////////////////////////////

    fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Start => self.handle_start(),
            ClientCommand::Stop => self.handle_stop(),
            ClientCommand::Restart => {
                self.handle_stop();
                self.handle_start();
            }
            ClientCommand::GetConnection(waiter) => self.handle_get_connection(waiter),
            ClientCommand::CreateSubscription { id, config, reply } => {
                let _ = reply.send(self.create_subscription(id, config));
            }
            ClientCommand::RemoveSubscription { id, reply } => {
                let _ = reply.send(self.remove_subscription(&id));
            }
            ClientCommand::GetSubscription { id, reply } => {
                let _ = reply.send(self.registry.get(&id).map(Subscription::snapshot));
            }
            ClientCommand::Dispose(_) => unreachable!("handled by the run loop"),
        }
    }

    fn handle_start(&mut self) {
        match self.state.kind() {
            ClientStateKind::Uninitialized | ClientStateKind::Stopped => self.start_connecting(),
            kind => log::debug!("Start ignored in state {kind:?}"),
        }
    }

    fn handle_stop(&mut self) {
        match self.state.kind() {
            ClientStateKind::Connecting => {
                if let Some(cancel) = self.cancel.take() {
                    cancel.cancel();
                }
                self.transition(ClientState::Stopped);
            }
            ClientStateKind::Connected => {
                self.transition_with(ClientState::Stopped, Self::cleanup_connection);
            }
            ClientStateKind::Awaiting => {
                if let Some(timer) = self.timer_task.take() {
                    timer.abort();
                }
                self.transition(ClientState::Stopped);
            }
            ClientStateKind::Uninitialized => self.transition(ClientState::Stopped),
            ClientStateKind::Stopped | ClientStateKind::Disposed => {}
        }
    }

    fn handle_get_connection(&mut self, waiter: ConnectionWaiter) {
        match &self.state {
            ClientState::Connected(connection) => {
                let _ = waiter.send(Ok(Arc::clone(connection)));
            }
            ClientState::Disposed => {
                let _ = waiter.send(Err(RtmError::Disposed));
            }
            _ => {
                if let Err(waiter) = self.offline_queue.push(waiter) {
                    let _ = waiter.send(Err(RtmError::QueueFull));
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Internal events
    ////////////////////////////////////////////////////////////////////////////

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::ConnectOutcome { generation, result } => {
                self.on_connect_outcome(generation, result);
            }
            InternalEvent::SocketClosed { generation } => {
                if generation != self.generation
                    || self.state.kind() != ClientStateKind::Connected
                {
                    return;
                }
                self.notify_client(ClientEvent::Error(RtmError::Disconnected));
                self.fail_to_awaiting();
            }
            InternalEvent::Unsolicited { generation, pdu } => {
                if generation != self.generation
                    || self.state.kind() != ClientStateKind::Connected
                {
                    return;
                }
                self.on_unsolicited(pdu);
            }
            InternalEvent::ReconnectTimerFired { generation } => {
                if generation != self.generation || self.state.kind() != ClientStateKind::Awaiting
                {
                    return;
                }
                self.timer_task = None;
                self.start_connecting();
            }
            InternalEvent::SubscribeOutcome { id, epoch, result } => {
                self.on_subscribe_outcome(&id, epoch, result);
            }
            InternalEvent::UnsubscribeOutcome { id, epoch, result } => {
                self.on_unsubscribe_outcome(&id, epoch, result);
            }
        }
    }

    fn on_connect_outcome(&mut self, generation: u64, result: RtmResult<Arc<Connection>>) {
        if generation != self.generation || self.state.kind() != ClientStateKind::Connecting {
            // Loser attempt: dispose of its connection if it won the dial
            if let Ok(connection) = result {
                tokio::spawn(async move { connection.close().await });
            }
            return;
        }
        self.cancel = None;
        match result {
            Ok(connection) => self.enter_connected(connection),
            Err(error) => {
                log::debug!("Connect attempt failed: {error}");
                self.notify_client(ClientEvent::Error(error));
                self.fail_to_awaiting();
            }
        }
    }

    fn on_unsolicited(&mut self, pdu: Pdu) {
        match pdu.action.as_str() {
            ACTION_CORE_ERROR => {
                let body = PduErrorBody::from_value(&pdu.body);
                log::error!("Fatal connection error: {}: {}", body.code, body.reason);
                self.notify_client(ClientEvent::Error(RtmError::Pdu {
                    code: body.code,
                    reason: body.reason,
                }));
                self.fail_to_awaiting();
            }
            ACTION_SUBSCRIPTION_DATA | ACTION_SUBSCRIPTION_INFO | ACTION_SUBSCRIPTION_ERROR => {
                self.route_subscription_pdu(pdu);
            }
            other => log::warn!("Ignoring unsolicited PDU with action `{other}`"),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Connection FSM transitions
    ////////////////////////////////////////////////////////////////////////////

    fn transition(&mut self, next: ClientState) {
        self.transition_with(next, |_| {});
    }

    /// Fires Leave(old), runs `during` while still in the old state, swaps the
    /// state, then fires Enter(new).
    fn transition_with(&mut self, next: ClientState, during: impl FnOnce(&mut Self)) {
        let old = self.state.kind();
        self.generation += 1;
        if old != ClientStateKind::Uninitialized {
            self.notify_client(ClientEvent::Leave(old));
        }
        during(self);
        self.state = next;
        let new = self.state.kind();
        log::debug!("Client state {old:?} -> {new:?}");
        if new != ClientStateKind::Uninitialized {
            self.notify_client(ClientEvent::Enter(new));
        }
    }

    fn start_connecting(&mut self) {
        self.transition(ClientState::Connecting);

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        let generation = self.generation;
        let connector = Arc::clone(&self.options.connector);
        let authenticator = self.options.authenticator.clone();
        let url = self.options.url.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = establish(&*connector, authenticator.as_deref(), &url, &cancel).await;
            let _ = internal_tx.send(InternalEvent::ConnectOutcome { generation, result });
        });
    }

    fn enter_connected(&mut self, connection: Arc<Connection>) {
        self.backoff.reset();
        self.transition(ClientState::Connected(Arc::clone(&connection)));
        self.offline_queue.drain_connected(&connection);

        let generation = self.generation;
        let internal_tx = self.internal_tx.clone();
        self.read_task = Some(tokio::spawn(async move {
            loop {
                match connection.do_step().await {
                    Step::Disconnected => {
                        let _ = internal_tx.send(InternalEvent::SocketClosed { generation });
                        break;
                    }
                    Step::Unsolicited(pdu) => {
                        if internal_tx
                            .send(InternalEvent::Unsolicited { generation, pdu })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Step::UnexpectedReply(pdu) => {
                        log::warn!(
                            "Ignoring reply with no matching pending request: action={}, id={:?}",
                            pdu.action,
                            pdu.id,
                        );
                    }
                    Step::ReplyDelivered => {}
                }
            }
        }));

        self.resubscribe_all();
    }

    fn fail_to_awaiting(&mut self) {
        let interval = self.backoff.next_interval();
        self.transition_with(ClientState::Awaiting, Self::cleanup_connection);

        let generation = self.generation;
        let internal_tx = self.internal_tx.clone();
        self.timer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = internal_tx.send(InternalEvent::ReconnectTimerFired { generation });
        }));
        log::debug!("Reconnect scheduled in {interval:?}");
    }

    /// Tears the live connection down; a no-op in any other state.
    ///
    /// Runs between the Leave and Enter events of the transition away from
    /// Connected, so subscription unwinds are observed in between.
    fn cleanup_connection(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let ClientState::Connected(connection) = &self.state {
            let connection = Arc::clone(connection);
            tokio::spawn(async move { connection.close().await });
            self.process_disconnected();
        }
    }

    fn dispose(&mut self) {
        if self.state.kind() == ClientStateKind::Disposed {
            return;
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(timer) = self.timer_task.take() {
            timer.abort();
        }
        self.transition_with(ClientState::Disposed, |this| {
            this.cleanup_connection();
            let ids: Vec<String> = this.registry.keys().cloned().collect();
            for id in ids {
                if let Some(sub) = this.registry.get_mut(&id) {
                    sub.epoch += 1;
                    sub.marked_for_deletion = true;
                    sub.future = None;
                }
                let state = this.registry.get(&id).map(|sub| sub.state);
                if state.is_some() && state != Some(SubscriptionStateKind::Unsubscribed) {
                    this.set_sub_state(&id, SubscriptionStateKind::Unsubscribed);
                }
                this.complete_deletion(&id);
            }
            this.offline_queue.fail_all(&RtmError::Disposed);
        });
        // The EnterDisposed event was snapshotted above; late registrations
        // see nothing.
        events::clear_observers(&self.client_observers);
        events::clear_observers(&self.sub_observers);
    }

    ////////////////////////////////////////////////////////////////////////////
    // Subscription registry
    ////////////////////////////////////////////////////////////////////////////

    fn create_subscription(&mut self, id: String, config: SubscriptionConfig) -> RtmResult<()> {
        if let Some(sub) = self.registry.get_mut(&id) {
            // Reconfiguration: unwind the live incarnation first, then swap
            // the stored config in as a brand-new subscription.
            sub.future = Some(config);
            if sub.marked_for_deletion {
                return Ok(());
            }
            sub.marked_for_deletion = true;
            let state = sub.state;
            self.unwind_marked(&id, state);
            Ok(())
        } else {
            self.install_subscription(id, config);
            Ok(())
        }
    }

    fn remove_subscription(&mut self, id: &str) -> RtmResult<()> {
        let state = match self.registry.get_mut(id) {
            Some(sub) => {
                sub.marked_for_deletion = true;
                sub.future = None;
                sub.state
            }
            None => {
                return Err(RtmError::InvalidOperation(format!(
                    "no subscription with id `{id}`"
                )));
            }
        };
        self.unwind_marked(id, state);
        Ok(())
    }

    /// Drives a freshly marked subscription towards deletion from `state`.
    fn unwind_marked(&mut self, id: &str, state: SubscriptionStateKind) {
        match state {
            SubscriptionStateKind::Unsubscribed => self.complete_deletion(id),
            SubscriptionStateKind::Failed => {
                // No connection interaction needed from Failed
                self.set_sub_state(id, SubscriptionStateKind::Unsubscribed);
                self.complete_deletion(id);
            }
            SubscriptionStateKind::Subscribed => self.start_unsubscribe(id),
            // In-flight request resolution picks the mark up
            SubscriptionStateKind::Subscribing | SubscriptionStateKind::Unsubscribing => {}
        }
    }

    fn install_subscription(&mut self, id: String, config: SubscriptionConfig) {
        let sub = Subscription::new(id.clone(), config);
        self.registry.insert(id.clone(), sub);
        self.notify_sub(SubscriptionEvent::Created {
            subscription_id: id.clone(),
        });
        self.notify_sub(SubscriptionEvent::Enter {
            subscription_id: id.clone(),
            state: SubscriptionStateKind::Unsubscribed,
        });
        self.try_subscribe(&id);
    }

    fn try_subscribe(&mut self, id: &str) {
        let ClientState::Connected(connection) = &self.state else {
            return;
        };
        let connection = Arc::clone(connection);

        let (body, epoch) = match self.registry.get(id) {
            Some(sub)
                if sub.state == SubscriptionStateKind::Unsubscribed
                    && !sub.marked_for_deletion =>
            {
                (sub.subscribe_body(), sub.epoch)
            }
            _ => return,
        };
        self.set_sub_state(id, SubscriptionStateKind::Subscribing);

        let internal_tx = self.internal_tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let result = connection.send_request(ACTION_SUBSCRIBE, body).await;
            let _ = internal_tx.send(InternalEvent::SubscribeOutcome { id, epoch, result });
        });
    }

    fn start_unsubscribe(&mut self, id: &str) {
        let ClientState::Connected(connection) = &self.state else {
            return;
        };
        let connection = Arc::clone(connection);

        let epoch = match self.registry.get(id) {
            Some(sub) if sub.state == SubscriptionStateKind::Subscribed => sub.epoch,
            _ => return,
        };
        self.set_sub_state(id, SubscriptionStateKind::Unsubscribing);

        let body = json!({ "subscription_id": id });
        let internal_tx = self.internal_tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let result = connection.send_request(ACTION_UNSUBSCRIBE, body).await;
            let _ = internal_tx.send(InternalEvent::UnsubscribeOutcome { id, epoch, result });
        });
    }

    fn on_subscribe_outcome(&mut self, id: &str, epoch: u64, result: RtmResult<Pdu>) {
        {
            let Some(sub) = self.registry.get(id) else { return };
            if sub.epoch != epoch || sub.state != SubscriptionStateKind::Subscribing {
                return;
            }
        }
        match result {
            Ok(reply) => {
                let queued: Vec<Pdu> = {
                    let Some(sub) = self.registry.get_mut(id) else { return };
                    sub.history = None;
                    if sub.track_position() {
                        sub.absorb_position(reply.body.get("position").and_then(Value::as_str));
                    } else {
                        sub.position = None;
                    }
                    sub.pending_events.drain(..).collect()
                };
                self.set_sub_state(id, SubscriptionStateKind::Subscribed);
                for pdu in queued {
                    self.deliver_subscription_pdu(id, pdu);
                }
                let marked = self
                    .registry
                    .get(id)
                    .is_some_and(|sub| sub.marked_for_deletion);
                if marked {
                    self.start_unsubscribe(id);
                }
            }
            Err(RtmError::Disconnected) => {
                // Expected race with a dropping connection, not a fault
                let marked = self.clear_pending_events(id);
                self.set_sub_state(id, SubscriptionStateKind::Unsubscribed);
                if marked {
                    self.complete_deletion(id);
                }
            }
            Err(error) => {
                let marked = self.clear_pending_events(id);
                self.set_sub_state(id, SubscriptionStateKind::Failed);
                self.notify_sub(SubscriptionEvent::SubscribeError {
                    subscription_id: id.to_string(),
                    error,
                });
                if marked {
                    self.set_sub_state(id, SubscriptionStateKind::Unsubscribed);
                    self.complete_deletion(id);
                }
            }
        }
    }

    fn clear_pending_events(&mut self, id: &str) -> bool {
        match self.registry.get_mut(id) {
            Some(sub) => {
                sub.pending_events.clear();
                sub.marked_for_deletion
            }
            None => false,
        }
    }

    fn on_unsubscribe_outcome(&mut self, id: &str, epoch: u64, result: RtmResult<Pdu>) {
        {
            let Some(sub) = self.registry.get(id) else { return };
            if sub.epoch != epoch || sub.state != SubscriptionStateKind::Unsubscribing {
                return;
            }
        }
        match result {
            Ok(reply) => {
                let marked = {
                    let Some(sub) = self.registry.get_mut(id) else { return };
                    sub.absorb_position(reply.body.get("position").and_then(Value::as_str));
                    sub.marked_for_deletion
                };
                self.set_sub_state(id, SubscriptionStateKind::Unsubscribed);
                if marked {
                    self.complete_deletion(id);
                }
            }
            Err(error) => {
                // Unrecoverable: the service's view of this subscription is
                // now unknown, so resynchronize by dropping the connection.
                log::warn!("Unsubscribe of `{id}` failed ({error}); forcing connection close");
                self.notify_sub(SubscriptionEvent::UnsubscribeError {
                    subscription_id: id.to_string(),
                    error,
                });
                if let ClientState::Connected(connection) = &self.state {
                    let connection = Arc::clone(connection);
                    tokio::spawn(async move { connection.close().await });
                }
            }
        }
    }

    /// Unwinds every subscription to Unsubscribed exactly once and completes
    /// any pending deletions.
    fn process_disconnected(&mut self) {
        let ids: Vec<String> = self.registry.keys().cloned().collect();
        for id in ids {
            let (state, marked) = match self.registry.get_mut(&id) {
                Some(sub) => {
                    sub.epoch += 1;
                    sub.pending_events.clear();
                    (sub.state, sub.marked_for_deletion)
                }
                None => continue,
            };
            if state != SubscriptionStateKind::Unsubscribed {
                self.set_sub_state(&id, SubscriptionStateKind::Unsubscribed);
            }
            if marked {
                self.complete_deletion(&id);
            }
        }
    }

    fn resubscribe_all(&mut self) {
        let ids: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, sub)| {
                sub.state == SubscriptionStateKind::Unsubscribed && !sub.marked_for_deletion
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.try_subscribe(&id);
        }
    }

    /// Removes the incarnation and instantiates its replacement, if any.
    fn complete_deletion(&mut self, id: &str) {
        let Some(sub) = self.registry.remove(id) else {
            return;
        };
        debug_assert_eq!(sub.state, SubscriptionStateKind::Unsubscribed);
        self.notify_sub(SubscriptionEvent::Leave {
            subscription_id: id.to_string(),
            state: SubscriptionStateKind::Unsubscribed,
        });
        self.notify_sub(SubscriptionEvent::Deleted {
            subscription_id: id.to_string(),
        });
        if let Some(config) = sub.future {
            log::debug!("Swapping in pending reconfiguration for `{id}`");
            self.install_subscription(id.to_string(), config);
        }
    }

    fn set_sub_state(&mut self, id: &str, next: SubscriptionStateKind) {
        let old = match self.registry.get_mut(id) {
            Some(sub) if sub.state != next => {
                let old = sub.state;
                sub.state = next;
                old
            }
            _ => return,
        };
        log::debug!("Subscription `{id}` {old:?} -> {next:?}");
        self.notify_sub(SubscriptionEvent::Leave {
            subscription_id: id.to_string(),
            state: old,
        });
        self.notify_sub(SubscriptionEvent::Enter {
            subscription_id: id.to_string(),
            state: next,
        });
    }

    ////////////////////////////////////////////////////////////////////////////
    // Subscription event routing
    ////////////////////////////////////////////////////////////////////////////

    fn route_subscription_pdu(&mut self, pdu: Pdu) {
        let Some(id) = pdu
            .body
            .get("subscription_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            log::warn!("Subscription PDU without subscription_id: {}", pdu.action);
            return;
        };
        let state = match self.registry.get(&id) {
            Some(sub) => sub.state,
            None => {
                log::debug!("Dropping `{}` for unknown subscription `{id}`", pdu.action);
                return;
            }
        };
        match state {
            // Events can outrun the subscribe reply; hold them until then
            SubscriptionStateKind::Subscribing => {
                if let Some(sub) = self.registry.get_mut(&id) {
                    sub.pending_events.push(pdu);
                }
            }
            SubscriptionStateKind::Subscribed => self.deliver_subscription_pdu(&id, pdu),
            other => {
                log::debug!("Dropping `{}` for `{id}` in state {other:?}", pdu.action);
            }
        }
    }

    fn deliver_subscription_pdu(&mut self, id: &str, pdu: Pdu) {
        if self.registry.get(id).map(|sub| sub.state) != Some(SubscriptionStateKind::Subscribed) {
            return;
        }
        let position = pdu
            .body
            .get("position")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(sub) = self.registry.get_mut(id) {
            sub.absorb_position(position.as_deref());
        }

        match pdu.action.as_str() {
            ACTION_SUBSCRIPTION_DATA => {
                let messages = pdu
                    .body
                    .get("messages")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                self.notify_sub(SubscriptionEvent::Data {
                    subscription_id: id.to_string(),
                    messages,
                    position,
                });
            }
            ACTION_SUBSCRIPTION_INFO => {
                let info = pdu
                    .body
                    .get("info")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let reason = pdu
                    .body
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.notify_sub(SubscriptionEvent::Info {
                    subscription_id: id.to_string(),
                    info,
                    reason,
                    position,
                });
            }
            ACTION_SUBSCRIPTION_ERROR => {
                let body = PduErrorBody::from_value(&pdu.body);
                self.set_sub_state(id, SubscriptionStateKind::Failed);
                self.notify_sub(SubscriptionEvent::Error {
                    subscription_id: id.to_string(),
                    code: body.code,
                    reason: body.reason,
                    position,
                });
            }
            other => log::warn!("Unhandled subscription action `{other}`"),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Event emission
    ////////////////////////////////////////////////////////////////////////////

    fn notify_client(&self, event: ClientEvent) {
        events::notify(&self.client_observers, &self.dispatcher, event);
    }

    fn notify_sub(&self, event: SubscriptionEvent) {
        events::notify(&self.sub_observers, &self.dispatcher, event);
    }
}

/// Dials the transport and pumps the authentication handshake to completion.
async fn establish(
    connector: &dyn Connector,
    authenticator: Option<&dyn Authenticator>,
    url: &str,
    cancel: &CancellationToken,
) -> RtmResult<Arc<Connection>> {
    let connection = Arc::new(connector.connect(url, cancel).await?);

    if let Some(authenticator) = authenticator {
        let mut auth = authenticator.authenticate(&connection);
        loop {
            tokio::select! {
                result = &mut auth => {
                    if let Err(error) = result {
                        connection.close().await;
                        return Err(error);
                    }
                    break;
                }
                // Replies only resolve while someone pumps the reader
                step = connection.do_step() => {
                    if matches!(step, Step::Disconnected) {
                        return Err(RtmError::Disconnected);
                    }
                }
                () = cancel.cancelled() => {
                    connection.close().await;
                    return Err(RtmError::Transport("connection attempt cancelled".to_string()));
                }
            }
        }
    }
    Ok(connection)
}
