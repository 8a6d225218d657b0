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

//! Public event surface and observer registry.
//!
//! Events are delivered FIFO through the [`Dispatcher`] so observers see
//! transitions exactly in emission order. A panicking observer is contained
//! by a fault barrier and logged; it never aborts delivery to the remaining
//! observers or corrupts core state.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{dispatcher::Dispatcher, error::RtmError, subscription::SubscriptionStateKind};

/// Observable client connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStateKind {
    Uninitialized,
    Stopped,
    Connecting,
    Connected,
    Awaiting,
    Disposed,
}

/// Client lifecycle events.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The client entered the given state.
    Enter(ClientStateKind),
    /// The client left the given state.
    Leave(ClientStateKind),
    /// A connection-level error was surfaced.
    Error(RtmError),
}

/// Subscription lifecycle and data events.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// A subscription incarnation was added to the registry.
    Created { subscription_id: String },
    /// A subscription incarnation was removed from the registry.
    Deleted { subscription_id: String },
    /// The subscription entered the given state.
    Enter {
        subscription_id: String,
        state: SubscriptionStateKind,
    },
    /// The subscription left the given state.
    Leave {
        subscription_id: String,
        state: SubscriptionStateKind,
    },
    /// A batch of channel messages arrived.
    Data {
        subscription_id: String,
        messages: Vec<Value>,
        position: Option<String>,
    },
    /// An informational notice arrived (e.g. `fast_forward`).
    Info {
        subscription_id: String,
        info: String,
        reason: Option<String>,
        position: Option<String>,
    },
    /// The service pushed a subscription error; the subscription failed.
    Error {
        subscription_id: String,
        code: String,
        reason: String,
        position: Option<String>,
    },
    /// The subscribe request was rejected.
    SubscribeError {
        subscription_id: String,
        error: RtmError,
    },
    /// The unsubscribe request failed; the connection is being force-closed.
    UnsubscribeError {
        subscription_id: String,
        error: RtmError,
    },
}

/// Identifier handed back on registration, usable for detaching.
pub type ObserverId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of observer callbacks for one event type.
pub(crate) struct ObserverSet<E> {
    next_id: ObserverId,
    entries: Vec<(ObserverId, Callback<E>)>,
}

impl<E> ObserverSet<E> {
    pub(crate) const fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, callback: Callback<E>) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn snapshot(&self) -> Vec<Callback<E>> {
        self.entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

pub(crate) type SharedObservers<E> = Arc<Mutex<ObserverSet<E>>>;

pub(crate) fn new_observers<E>() -> SharedObservers<E> {
    Arc::new(Mutex::new(ObserverSet::new()))
}

fn lock_observers<E>(observers: &SharedObservers<E>) -> std::sync::MutexGuard<'_, ObserverSet<E>> {
    match observers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn add_observer<E>(observers: &SharedObservers<E>, callback: Callback<E>) -> ObserverId {
    lock_observers(observers).add(callback)
}

pub(crate) fn remove_observer<E>(observers: &SharedObservers<E>, id: ObserverId) -> bool {
    lock_observers(observers).remove(id)
}

pub(crate) fn clear_observers<E>(observers: &SharedObservers<E>) {
    lock_observers(observers).clear();
}

/// Posts one dispatcher job that delivers `event` to the current observers.
///
/// The observer list is snapshotted synchronously, so registrations after
/// this call do not see the event.
pub(crate) fn notify<E>(observers: &SharedObservers<E>, dispatcher: &Dispatcher, event: E)
where
    E: Send + 'static,
{
    let snapshot = lock_observers(observers).snapshot();
    if snapshot.is_empty() {
        return;
    }
    dispatcher.post(async move {
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                log::error!("Observer callback panicked; continuing delivery");
            }
        }
    });
}
