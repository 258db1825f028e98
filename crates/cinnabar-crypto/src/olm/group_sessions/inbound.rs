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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::megolm::{
    DecryptedMessage, DecryptionError, ExportedSessionKey, InboundGroupSession as InnerSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use super::ExportedRoomKey;
use crate::types::{
    events::{ForwardedRoomKeyContent, RoomKeyContent},
    MEGOLM_V1_ALGORITHM,
};

/// An inbound Megolm session, imported from an `m.room_key` event, a
/// forwarded key or a backup.
///
/// The ratchet only ever advances forward during decryption; the earliest
/// index the session knows about is fixed at import time.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The signing keys the creating device claimed to have.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The devices this key passed through before reaching us. Empty for
    /// keys received directly from the creator.
    pub forwarding_key_chain: Vec<String>,
    first_known_index: u32,
    /// Whether this session was imported (from a forwarded key or backup)
    /// rather than received directly.
    pub imported: bool,
    /// Whether this session has been uploaded to the server-side backup.
    pub backed_up: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl InboundGroupSession {
    /// Create a session from a freshly received `m.room_key` content.
    pub fn from_room_key(
        sender_key: &str,
        sender_claimed_ed25519_key: Option<&str>,
        content: &RoomKeyContent,
    ) -> Result<Self, vodozemac::megolm::SessionKeyDecodeError> {
        let key = SessionKey::from_base64(&content.session_key)?;
        let session = InnerSession::new(&key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let mut sender_claimed_keys = BTreeMap::new();
        if let Some(key) = sender_claimed_ed25519_key {
            sender_claimed_keys.insert("ed25519".to_owned(), key.to_owned());
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: content.room_id.clone(),
            sender_key: sender_key.to_owned(),
            sender_claimed_keys,
            forwarding_key_chain: Vec::new(),
            first_known_index,
            imported: false,
            backed_up: false,
        })
    }

    /// Import a session from an `m.forwarded_room_key` content.
    ///
    /// The forwarding device is appended to the forwarding chain.
    pub fn from_forwarded_key(
        forwarding_device_key: &str,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, vodozemac::megolm::SessionKeyDecodeError> {
        let key = ExportedSessionKey::from_base64(&content.session_key)?;
        let session = InnerSession::import(&key, SessionConfig::version_1());

        let mut forwarding_key_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_key_chain.push(forwarding_device_key.to_owned());

        let mut sender_claimed_keys = BTreeMap::new();
        if let Some(key) = &content.sender_claimed_ed25519_key {
            sender_claimed_keys.insert("ed25519".to_owned(), key.clone());
        }

        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: content.room_id.clone(),
            sender_key: content.sender_key.clone(),
            sender_claimed_keys,
            forwarding_key_chain,
            first_known_index,
            imported: true,
            backed_up: false,
        })
    }

    /// Import a session from an exported room key (key export or backup).
    pub fn from_export(
        export: &ExportedRoomKey,
    ) -> Result<Self, vodozemac::megolm::SessionKeyDecodeError> {
        let key = ExportedSessionKey::from_base64(&export.session_key)?;
        let session = InnerSession::import(&key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: export.room_id.clone(),
            sender_key: export.sender_key.clone(),
            sender_claimed_keys: export.sender_claimed_keys.clone(),
            forwarding_key_chain: export.forwarding_curve25519_key_chain.clone(),
            first_known_index,
            imported: true,
            backed_up: false,
        })
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The earliest message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Whether this session was imported rather than received directly.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Decrypt a Megolm message, returning the plaintext and the message
    /// index it was encrypted at.
    pub async fn decrypt(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Export the session at its earliest known index.
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index).await.expect(
            "We can always export a session at its earliest known index",
        )
    }

    /// Export the session at the given message index.
    pub async fn export_at_index(&self, index: u32) -> Option<ExportedRoomKey> {
        let key = self.inner.lock().await.export_at(index)?;

        Some(ExportedRoomKey {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.to_string(),
            session_key: key.to_base64(),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_key_chain.clone(),
        })
    }

    /// Mark the session as uploaded to the backup.
    pub fn mark_as_backed_up(&mut self) {
        self.backed_up = true;
    }

    /// Pickle the session for storage.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.lock().await.pickle(),
            session_id: self.session_id.to_string(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_key_chain: self.forwarding_key_chain.clone(),
            imported: self.imported,
            backed_up: self.backed_up,
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: pickle.session_id.into(),
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            sender_claimed_keys: pickle.sender_claimed_keys,
            forwarding_key_chain: pickle.forwarding_key_chain,
            first_known_index,
            imported: pickle.imported,
            backed_up: pickle.backed_up,
        }
    }
}

/// A pickled version of an `InboundGroupSession`.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickled ratchet state.
    pub pickle: InboundGroupSessionPickle,
    /// The id of the session.
    pub session_id: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The signing keys the creating device claimed to have.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The forwarding chain of the session.
    #[serde(default)]
    pub forwarding_key_chain: Vec<String>,
    /// Whether the session was imported.
    #[serde(default)]
    pub imported: bool,
    /// Whether the session was uploaded to the backup.
    #[serde(default)]
    pub backed_up: bool,
}

impl InboundGroupSession {
    /// Does this session belong to the given room.
    pub fn belongs_to(&self, room_id: &RoomId) -> bool {
        self.room_id == room_id
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::InboundGroupSession;
    use crate::olm::{EncryptionSettings, OutboundGroupSession};

    #[tokio::test]
    async fn room_key_import_and_in_order_decryption() {
        let outbound = OutboundGroupSession::new(
            room_id!("!room:localhost"),
            EncryptionSettings::default(),
        );
        let room_key = outbound.as_room_key_content().await;

        let inbound = InboundGroupSession::from_room_key("SENDERKEY", None, &room_key)
            .expect("A freshly exported session key should import");

        assert_eq!(inbound.session_id(), outbound.session_id());
        assert_eq!(inbound.first_known_index(), 0);

        for i in 0..4u8 {
            let encrypted = outbound
                .encrypt("m.room.message", serde_json::json!({"body": format!("msg {i}")}))
                .await
                .unwrap();

            let decrypted = inbound.decrypt(&encrypted.ciphertext).await.unwrap();
            assert_eq!(decrypted.message_index, u32::from(i));
        }
    }

    #[tokio::test]
    async fn late_export_cannot_decrypt_earlier_messages() {
        let outbound = OutboundGroupSession::new(
            room_id!("!room:localhost"),
            EncryptionSettings::default(),
        );

        let early = outbound
            .encrypt("m.room.message", serde_json::json!({"body": "early"}))
            .await
            .unwrap();

        // Key exported after the first message was sent.
        let room_key = outbound.as_room_key_content().await;
        let inbound = InboundGroupSession::from_room_key("SENDERKEY", None, &room_key).unwrap();

        assert_eq!(inbound.first_known_index(), 1);
        inbound
            .decrypt(&early.ciphertext)
            .await
            .expect_err("A ratchet imported at index 1 must not decrypt index 0");
    }

    #[tokio::test]
    async fn export_round_trip() {
        let outbound = OutboundGroupSession::new(
            room_id!("!room:localhost"),
            EncryptionSettings::default(),
        );
        let room_key = outbound.as_room_key_content().await;
        let inbound = InboundGroupSession::from_room_key("SENDERKEY", None, &room_key).unwrap();

        let export = inbound.export().await;
        let imported = InboundGroupSession::from_export(&export).unwrap();

        assert_eq!(imported.session_id(), inbound.session_id());
        assert!(imported.has_been_imported());

        let encrypted = outbound
            .encrypt("m.room.message", serde_json::json!({"body": "hello"}))
            .await
            .unwrap();
        let decrypted = imported.decrypt(&encrypted.ciphertext).await.unwrap();
        assert_eq!(decrypted.message_index, 0);
    }
}
