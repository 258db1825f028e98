// Copyright 2025 The cinnabar developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, IdentityKeys, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use super::StaticAccountData;
use crate::{
    error::{EventError, OlmResult},
    types::{events::OlmEncryptedContent, DeviceData},
};

/// A 1:1 double-ratchet session with another device.
///
/// The ratchet advances on every encrypt and decrypt; the session must be
/// persisted after each use and a stale copy must never be reused, since a
/// replayed ratchet state leaks key material.
#[derive(Clone)]
pub struct Session {
    /// The user the peer device belongs to.
    pub user_id: OwnedUserId,
    /// The peer device. May be empty for inbound sessions until the device
    /// is known.
    pub device_id: OwnedDeviceId,
    /// Our own long-term identity keys.
    pub our_identity_keys: Arc<IdentityKeys>,
    /// The double-ratchet state.
    pub inner: Arc<Mutex<InnerSession>>,
    /// The unique id of this session.
    pub session_id: Arc<str>,
    /// The Curve25519 key of the peer device.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

impl Session {
    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Decrypt the given Olm message, advancing the ratchet.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        trace!(session_id = self.session_id(), "Decrypted an Olm message");

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(String::from_utf8_lossy(&plaintext).to_string())
    }

    /// Encrypt a raw plaintext string, advancing the ratchet.
    pub async fn encrypt_raw(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Encrypt an event for the peer device as an `m.room.encrypted`
    /// to-device content.
    ///
    /// The plaintext envelope binds our identity and the recipient's signing
    /// key, which the recipient checks after decrypting.
    pub async fn encrypt(
        &mut self,
        own: &StaticAccountData,
        recipient_device: &DeviceData,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmEncryptedContent> {
        let recipient_signing_key =
            recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;

        let payload = json!({
            "sender": own.user_id,
            "sender_device": own.device_id,
            "keys": {
                "ed25519": self.our_identity_keys.ed25519.to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_signing_key.to_base64(),
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.encrypt_raw(&plaintext).await;

        Ok(OlmEncryptedContent::new(
            self.our_identity_keys.curve25519.to_base64(),
            self.sender_key.to_base64(),
            ciphertext,
        ))
    }

    /// Pickle the session together with its metadata.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            session_id: self.session_id.to_string(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(our_identity_keys: Arc<IdentityKeys>, pickle: PickledSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

/// A pickled version of a `Session`, holding everything that needs to go
/// into the store.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickled double-ratchet state.
    pub pickle: SessionPickle,
    /// The unique id of the session, so stores can replace the right entry.
    pub session_id: String,
    /// The user the peer device belongs to.
    pub user_id: OwnedUserId,
    /// The peer device id.
    pub device_id: OwnedDeviceId,
    /// The Curve25519 key of the peer device.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
