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

//! Subscription state, configuration, and the per-subscription FSM data.
//!
//! Each subscription id has at most one live incarnation. Reconfiguring or
//! removing a live subscription marks it for deletion; the replacement config
//! (if any) is only instantiated after the current incarnation fully unwinds
//! to Unsubscribed.

use bitflags::bitflags;
use serde_json::{Map, Value, json};

use crate::pdu::Pdu;

bitflags! {
    /// Delivery-guarantee flags for a subscription.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SubscriptionMode: u8 {
        /// Track the stream position across resubscribes.
        const TRACK_POSITION = 1 << 0;
        /// Let the service skip ahead when the client falls behind.
        const FAST_FORWARD = 1 << 1;
    }
}

impl SubscriptionMode {
    /// At-most-once delivery, never stalls the connection.
    pub const SIMPLE: Self = Self::FAST_FORWARD;
    /// Resumes from the last seen position but may skip ahead under pressure.
    pub const RELIABLE: Self = Self::TRACK_POSITION.union(Self::FAST_FORWARD);
    /// Strict position tracking; an expired position fails the subscription.
    pub const ADVANCED: Self = Self::TRACK_POSITION;
}

impl Default for SubscriptionMode {
    fn default() -> Self {
        Self::RELIABLE
    }
}

/// History replay requested on the first subscribe of an incarnation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct History {
    /// Maximum number of past messages to replay.
    pub count: Option<u64>,
    /// Maximum age in seconds of replayed messages.
    pub age: Option<u64>,
}

impl History {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count.is_none() && self.age.is_none()
    }
}

/// User-supplied configuration for one subscription incarnation.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    pub mode: SubscriptionMode,
    /// fSQL view expression; when set, the subscription id names a view
    /// rather than a channel.
    pub filter: Option<String>,
    /// View update period in seconds, only meaningful with a filter.
    pub period: Option<u64>,
    /// Starting position for the first subscribe.
    pub position: Option<String>,
    /// History replay, consumed by the first successful subscribe.
    pub history: Option<History>,
}

/// Lifecycle states of a subscription incarnation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStateKind {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
    Failed,
}

/// Point-in-time view of a subscription, as returned to callers.
#[derive(Clone, Debug)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub state: SubscriptionStateKind,
    pub mode: SubscriptionMode,
    pub position: Option<String>,
    pub marked_for_deletion: bool,
}

/// Core-owned state for one subscription incarnation.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) id: String,
    pub(crate) mode: SubscriptionMode,
    pub(crate) filter: Option<String>,
    pub(crate) period: Option<u64>,
    pub(crate) position: Option<String>,
    pub(crate) history: Option<History>,
    pub(crate) state: SubscriptionStateKind,
    /// Bumped whenever the incarnation unwinds, so stale in-flight replies
    /// are discarded.
    pub(crate) epoch: u64,
    pub(crate) marked_for_deletion: bool,
    /// Replacement config swapped in once this incarnation is deleted.
    pub(crate) future: Option<SubscriptionConfig>,
    /// Events received between the subscribe request and its reply, replayed
    /// once Subscribed.
    pub(crate) pending_events: Vec<Pdu>,
}

impl Subscription {
    pub(crate) fn new(id: String, config: SubscriptionConfig) -> Self {
        Self {
            id,
            mode: config.mode,
            filter: config.filter,
            period: config.period,
            position: config.position,
            history: config.history.filter(|h| !h.is_empty()),
            state: SubscriptionStateKind::Unsubscribed,
            epoch: 0,
            marked_for_deletion: false,
            future: None,
            pending_events: Vec::new(),
        }
    }

    pub(crate) fn track_position(&self) -> bool {
        self.mode.contains(SubscriptionMode::TRACK_POSITION)
    }

    /// Records a position carried by a data/info/error event or reply.
    ///
    /// Only applied in position-tracking mode, and only for non-empty values.
    pub(crate) fn absorb_position(&mut self, position: Option<&str>) {
        if !self.track_position() {
            return;
        }
        if let Some(position) = position {
            if !position.is_empty() {
                self.position = Some(position.to_string());
            }
        }
    }

    /// Builds the `rtm/subscribe` request body for this incarnation.
    ///
    /// The history block is included here but only cleared once the subscribe
    /// succeeds, so a disconnected attempt can retry it.
    pub(crate) fn subscribe_body(&self) -> Value {
        let mut body = Map::new();
        if let Some(filter) = &self.filter {
            body.insert("subscription_id".to_string(), json!(self.id));
            body.insert("filter".to_string(), json!(filter));
            if let Some(period) = self.period {
                body.insert("period".to_string(), json!(period));
            }
        } else {
            body.insert("channel".to_string(), json!(self.id));
        }
        if self.mode.contains(SubscriptionMode::FAST_FORWARD) {
            body.insert("fast_forward".to_string(), json!(true));
        }
        if self.track_position() {
            if let Some(position) = &self.position {
                body.insert("position".to_string(), json!(position));
            }
        }
        if let Some(history) = &self.history {
            let mut block = Map::new();
            if let Some(count) = history.count {
                block.insert("count".to_string(), json!(count));
            }
            if let Some(age) = history.age {
                block.insert("age".to_string(), json!(age));
            }
            body.insert("history".to_string(), Value::Object(block));
        }
        Value::Object(body)
    }

    pub(crate) fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_id: self.id.clone(),
            state: self.state,
            mode: self.mode,
            position: self.position.clone(),
            marked_for_deletion: self.marked_for_deletion,
        }
    }
}
