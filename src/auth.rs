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

//! Role/secret authentication handshake.
//!
//! The service issues a nonce on `auth/handshake`; the client answers
//! `auth/authenticate` with `base64(HMAC-MD5(secret, nonce))`. The protocol
//! mandates HMAC-MD5 for this keyed challenge (not used for integrity).

use base64::prelude::*;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::{Value, json};

use crate::{
    connection::Connection,
    consts::{ACTION_AUTH_AUTHENTICATE, ACTION_AUTH_HANDSHAKE},
    error::{RtmError, RtmResult},
};
use async_trait::async_trait;

/// Performs the authentication handshake on a freshly opened connection.
///
/// Runs between transport connect and Connected entry; a failure aborts the
/// connect attempt.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates over `connection`, returning an error to fail the
    /// connect attempt.
    async fn authenticate(&self, connection: &Connection) -> RtmResult<()>;
}

/// Role and secret key pair for [`RoleAuthenticator`].
#[derive(Clone)]
pub struct RoleCredential {
    role: String,
    secret: String,
}

impl RoleCredential {
    #[must_use]
    pub fn new(role: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            secret: secret.into(),
        }
    }

    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

// Redact the secret from debug output
impl std::fmt::Debug for RoleCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(RoleCredential))
            .field("role", &self.role)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Out-of-the-box role/secret authenticator.
#[derive(Clone, Debug)]
pub struct RoleAuthenticator {
    credential: RoleCredential,
}

impl RoleAuthenticator {
    #[must_use]
    pub const fn new(credential: RoleCredential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl Authenticator for RoleAuthenticator {
    async fn authenticate(&self, connection: &Connection) -> RtmResult<()> {
        let handshake = connection
            .send_request(
                ACTION_AUTH_HANDSHAKE,
                json!({
                    "method": "role_secret",
                    "data": { "role": self.credential.role() },
                }),
            )
            .await
            .map_err(into_auth_error)?;

        let nonce = handshake
            .body
            .get("data")
            .and_then(|data| data.get("nonce"))
            .and_then(Value::as_str)
            .ok_or_else(|| RtmError::Auth("handshake reply missing nonce".to_string()))?;

        let hash = role_secret_hash(self.credential.secret(), nonce)?;
        connection
            .send_request(
                ACTION_AUTH_AUTHENTICATE,
                json!({ "method": "role_secret", "credentials": { "hash": hash } }),
            )
            .await
            .map_err(into_auth_error)?;

        log::debug!("Authenticated as role `{}`", self.credential.role());
        Ok(())
    }
}

fn into_auth_error(error: RtmError) -> RtmError {
    match error {
        RtmError::Pdu { code, reason } => RtmError::Auth(format!("{code}: {reason}")),
        other => other,
    }
}

/// Computes `base64(HMAC-MD5(secret, nonce))` for the role/secret handshake.
///
/// # Errors
///
/// Returns an error if the secret cannot key the MAC.
pub fn role_secret_hash(secret: &str, nonce: &str) -> RtmResult<String> {
    let mut mac = Hmac::<Md5>::new_from_slice(secret.as_bytes())
        .map_err(|e| RtmError::Auth(format!("invalid secret key: {e}")))?;
    mac.update(nonce.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}
