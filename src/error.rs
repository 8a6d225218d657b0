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

//! Error types returned across the public API.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type RtmResult<T> = Result<T, RtmError>;

/// Errors surfaced by client operations and connection events.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RtmError {
    /// Transport-level failure (TCP, TLS, or WebSocket).
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Negative reply from the service for a correlated request.
    #[error("request rejected: {code}: {reason}")]
    Pdu { code: String, reason: String },

    /// The connection dropped before the operation completed.
    #[error("connection dropped")]
    Disconnected,

    /// The offline queue is at capacity and cannot hold another waiter.
    #[error("offline queue full")]
    QueueFull,

    /// The operation is not valid for the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The client has been disposed.
    #[error("client disposed")]
    Disposed,

    /// A reply arrived whose action is neither the positive nor the negative
    /// form of the request action.
    #[error("unknown reply outcome: {0}")]
    UnknownOutcome(String),

    /// PDU serialization failed.
    #[error("JSON encoding failed: {0}")]
    Encoding(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RtmError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
