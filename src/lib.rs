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

//! Client SDK for the RTM publish/subscribe messaging service.
//!
//! The client multiplexes every request, reply, and subscription stream over
//! one persistent WebSocket carrying JSON PDUs. A single core task owns all
//! connection and subscription state; the cloneable [`RtmClient`] handle
//! exposes lifecycle control, channel operations, and observer registration.
//!
//! - Automatic reconnection with jittered exponential backoff.
//! - Subscriptions resubscribe transparently across reconnects, optionally
//!   resuming from their last tracked stream position.
//! - Callers issued while disconnected wait in a bounded offline queue.
//! - All user callbacks are delivered in order on a serialized dispatcher.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod connection;
pub mod consts;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod pdu;
pub mod subscription;

mod handler;
mod queue;

pub use auth::{Authenticator, RoleAuthenticator, RoleCredential};
pub use client::{Ack, RtmClient, RtmClientBuilder};
pub use connection::{Connection, Connector, Step, WsConnector};
pub use dispatcher::Dispatcher;
pub use error::{RtmError, RtmResult};
pub use events::{ClientEvent, ClientStateKind, ObserverId, SubscriptionEvent};
pub use pdu::{Pdu, PduErrorBody, ReplyOutcome};
pub use subscription::{
    History, SubscriptionConfig, SubscriptionMode, SubscriptionSnapshot, SubscriptionStateKind,
};
