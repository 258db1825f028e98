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

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use ruma::{OwnedRoomId, RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use vodozemac::megolm::{GroupSession, GroupSessionPickle, SessionConfig, SessionKey};

use crate::types::events::{MegolmEncryptedContent, MegolmPayload, RoomKeyContent};

const ROTATION_PERIOD: Duration = Duration::from_secs(3600 * 24 * 7);
const ROTATION_MESSAGES: u64 = 100;

/// Policy deciding when an outbound group session must be rotated.
///
/// Rotation on membership change is the caller's responsibility; the policy
/// here only covers age and message count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// Rotate the session once it is older than this many seconds.
    pub rotation_period_secs: u64,
    /// Rotate the session after this many encrypted messages.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            rotation_period_secs: ROTATION_PERIOD.as_secs(),
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

/// Whether a session is still usable for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExpirationStatus {
    /// The session can still be used.
    Usable,
    /// The session hit its rotation policy and a new one must be created.
    Expired,
    /// The caller invalidated the session, e.g. because the room membership
    /// changed.
    Invalidated,
}

/// An outbound Megolm session for a single room.
///
/// The message index increases monotonically with every encrypted message;
/// the session key is shared with the room members over Olm.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    /// The room this session encrypts for.
    pub room_id: OwnedRoomId,
    session_id: Arc<str>,
    creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    invalidated: Arc<AtomicBool>,
    settings: EncryptionSettings,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a new outbound session for the given room.
    pub fn new(room_id: &RoomId, settings: EncryptionSettings) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            room_id: room_id.to_owned(),
            session_id: session_id.into(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings,
        }
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The exportable session key at the current ratchet index.
    ///
    /// This is what gets distributed to room members in `m.room_key`
    /// events; members can only decrypt messages from this index on.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// The `m.room_key` to-device content announcing this session.
    pub async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent::new(
            self.room_id.clone(),
            self.session_id.to_string(),
            self.session_key().await.to_base64(),
        )
    }

    /// The current message index of the session.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// Encrypt the given event as an `m.room.encrypted` room event content.
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<MegolmEncryptedContent, serde_json::Error> {
        let payload =
            MegolmPayload { event_type: event_type.to_owned(), content, room_id: self.room_id.clone() };
        let plaintext = serde_json::to_string(&payload)?;

        let ciphertext = self.inner.lock().await.encrypt(&plaintext);
        self.message_count.fetch_add(1, Ordering::SeqCst);

        Ok(MegolmEncryptedContent {
            algorithm: crate::types::MEGOLM_V1_ALGORITHM.to_owned(),
            ciphertext,
            session_id: self.session_id.to_string(),
            sender_key: None,
            device_id: None,
        })
    }

    /// Mark the session as no longer usable, e.g. after a membership change.
    pub fn invalidate(&self) {
        debug!(room_id = ?self.room_id, session_id = self.session_id(), "Invalidating group session");
        self.invalidated.store(true, Ordering::SeqCst);
    }

    /// Check the rotation policy.
    pub fn expiration_status(&self) -> SessionExpirationStatus {
        if self.invalidated.load(Ordering::SeqCst) {
            return SessionExpirationStatus::Invalidated;
        }

        if self.message_count.load(Ordering::SeqCst) >= self.settings.rotation_period_msgs {
            return SessionExpirationStatus::Expired;
        }

        let age = SecondsSinceUnixEpoch::now().get().checked_sub(self.creation_time.get());
        match age {
            Some(age) if u64::from(age) >= self.settings.rotation_period_secs => {
                SessionExpirationStatus::Expired
            }
            _ => SessionExpirationStatus::Usable,
        }
    }

    /// Is the session still usable for encryption.
    pub fn is_usable(&self) -> bool {
        self.expiration_status() == SessionExpirationStatus::Usable
    }

    /// Pickle the session for storage.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.lock().await.pickle(),
            room_id: self.room_id.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            invalidated: self.invalidated.load(Ordering::SeqCst),
            settings: self.settings,
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(pickle: PickledOutboundGroupSession) -> Self {
        let session = GroupSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            room_id: pickle.room_id,
            session_id: session_id.into(),
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: pickle.settings,
        }
    }
}

/// A pickled version of an `OutboundGroupSession`.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickled ratchet state.
    pub pickle: GroupSessionPickle,
    /// The room this session encrypts for.
    pub room_id: OwnedRoomId,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// How many messages were encrypted with the session.
    pub message_count: u64,
    /// Whether the session was invalidated.
    pub invalidated: bool,
    /// The rotation policy of the session.
    pub settings: EncryptionSettings,
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::{EncryptionSettings, OutboundGroupSession, SessionExpirationStatus};

    #[tokio::test]
    async fn message_count_expires_the_session() {
        let settings = EncryptionSettings { rotation_period_msgs: 2, ..Default::default() };
        let session = OutboundGroupSession::new(room_id!("!room:localhost"), settings);

        assert!(session.is_usable());

        session.encrypt("m.room.message", serde_json::json!({"body": "a"})).await.unwrap();
        assert!(session.is_usable());
        session.encrypt("m.room.message", serde_json::json!({"body": "b"})).await.unwrap();

        assert_eq!(session.expiration_status(), SessionExpirationStatus::Expired);
    }

    #[tokio::test]
    async fn invalidation_wins_over_everything() {
        let session =
            OutboundGroupSession::new(room_id!("!room:localhost"), Default::default());

        session.invalidate();

        assert_eq!(session.expiration_status(), SessionExpirationStatus::Invalidated);
        assert!(!session.is_usable());
    }
}
