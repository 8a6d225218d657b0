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

//! Protocol data units exchanged with the RTM service.
//!
//! Every frame on the wire is one JSON object with an `action`, an optional
//! correlation `id`, and an action-specific `body`. Requests that expect an
//! acknowledgement carry an `id`; the matching reply echoes it with the action
//! suffixed `/ok` or `/error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::{REPLY_ERROR_SUFFIX, REPLY_OK_SUFFIX};

/// A single protocol data unit.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Pdu {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Pdu {
    /// Creates a new PDU with the given action and body.
    #[must_use]
    pub fn new(action: impl Into<String>, id: Option<String>, body: Value) -> Self {
        Self {
            action: action.into(),
            id,
            body,
        }
    }

    /// Classifies this PDU as a reply to a request with `request_action`.
    #[must_use]
    pub fn reply_outcome(&self, request_action: &str) -> ReplyOutcome {
        match self.action.strip_prefix(request_action) {
            Some(REPLY_OK_SUFFIX) => ReplyOutcome::Positive,
            Some(REPLY_ERROR_SUFFIX) => ReplyOutcome::Negative,
            _ => ReplyOutcome::Unknown,
        }
    }
}

/// Outcome of matching a reply action against its request action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    Positive,
    Negative,
    Unknown,
}

/// Error payload carried in the body of a negative reply.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PduErrorBody {
    #[serde(rename = "error")]
    pub code: String,
    pub reason: String,
}

impl PduErrorBody {
    /// Extracts the error payload from a reply body, tolerating missing
    /// fields the way the service occasionally omits them.
    #[must_use]
    pub fn from_value(body: &Value) -> Self {
        let code = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let reason = body
            .get("reason")
            .and_then(Value::as_str)
            .map_or_else(|| code.clone(), str::to_string);
        Self { code, reason }
    }
}
