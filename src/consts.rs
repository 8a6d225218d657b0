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

//! Protocol action names and client defaults.

/// RTM protocol version appended to endpoint URLs.
pub const RTM_VERSION: &str = "v2";

/// Unsolicited action signalling a fatal connection-level error.
pub const ACTION_CORE_ERROR: &str = "/error";

pub const ACTION_AUTH_HANDSHAKE: &str = "auth/handshake";
pub const ACTION_AUTH_AUTHENTICATE: &str = "auth/authenticate";

pub const ACTION_PUBLISH: &str = "rtm/publish";
pub const ACTION_READ: &str = "rtm/read";
pub const ACTION_WRITE: &str = "rtm/write";
pub const ACTION_DELETE: &str = "rtm/delete";
pub const ACTION_SUBSCRIBE: &str = "rtm/subscribe";
pub const ACTION_UNSUBSCRIBE: &str = "rtm/unsubscribe";
pub const ACTION_SUBSCRIPTION_DATA: &str = "rtm/subscription/data";
pub const ACTION_SUBSCRIPTION_INFO: &str = "rtm/subscription/info";
pub const ACTION_SUBSCRIPTION_ERROR: &str = "rtm/subscription/error";

/// Suffix classifying a reply as positive.
pub const REPLY_OK_SUFFIX: &str = "/ok";
/// Suffix classifying a reply as negative.
pub const REPLY_ERROR_SUFFIX: &str = "/error";

pub const DEFAULT_MIN_RECONNECT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_OFFLINE_QUEUE_CAPACITY: usize = 16;

/// Cap on the backoff exponent so the doubling never overflows.
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Upper bound on the graceful close handshake before the socket is dropped.
pub const GRACEFUL_CLOSE_TIMEOUT_SECS: u64 = 5;
