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
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, OlmMessage, PreKeyMessage,
        SessionConfig,
    },
    Curve25519PublicKey,
};

use super::{Session, SignJson};
use crate::{
    error::{OlmError, SessionCreationError, SignatureError},
    types::{DeviceData, DeviceKeys, SignedKey, MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM,
            SIGNED_CURVE25519},
    utilities::encode,
};

/// One-time keys prepared for upload, keyed by `signed_curve25519:<key id>`.
pub type OneTimeKeys = BTreeMap<String, SignedKey>;

/// The number of one-time keys we keep on the server; half the vodozemac
/// maximum, matching what homeservers ask clients to maintain.
const TARGET_ONE_TIME_KEY_COUNT: u64 = 50;

/// The immutable identity data of the account.
#[derive(Debug, Clone)]
pub struct StaticAccountData {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of this device.
    pub device_id: OwnedDeviceId,
    /// The long-term Curve25519 and Ed25519 keys of the device.
    pub identity_keys: Arc<IdentityKeys>,
}

/// A hash of a received Olm message.
///
/// Kept in the store so a replayed prekey message can't be fed through an
/// already-advanced ratchet a second time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OlmMessageHash {
    /// The Curve25519 key of the sender.
    pub sender_key: String,
    /// SHA-256 over sender key and ciphertext.
    pub hash: String,
}

impl OlmMessageHash {
    pub(crate) fn new(sender_key: Curve25519PublicKey, ciphertext: &OlmMessage) -> Self {
        let (message_type, ciphertext) = ciphertext.clone().to_parts();
        let sender_key = sender_key.to_base64();

        let sha = Sha256::new()
            .chain_update(sender_key.as_bytes())
            .chain_update([message_type as u8])
            .chain_update(&ciphertext)
            .finalize();

        Self { sender_key, hash: encode(sha.as_slice()) }
    }
}

/// The long-term Olm account of this device.
///
/// Owns the identity keypair and the pool of one-time keys. Every mutation
/// must be followed by a persist through the store; the ratchet state of an
/// account must never be used twice across a persist boundary.
pub struct Account {
    static_data: StaticAccountData,
    inner: Box<InnerAccount>,
    /// Whether the device keys were uploaded to the server.
    shared: bool,
    /// The number of signed one-time keys the server reports for us.
    uploaded_key_count: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.static_data.user_id)
            .field("device_id", &self.static_data.device_id)
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared)
            .finish()
    }
}

/// A pickled version of an `Account`, suitable for persisting.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared with the server.
    pub shared: bool,
    /// The number of uploaded one-time keys the server knows about.
    pub uploaded_signed_key_count: u64,
}

impl Account {
    /// Create a fresh account; this generates the identity keypair and an
    /// initial pool of one-time keys.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let mut inner = InnerAccount::new();

        // Generate the initial one-time keys right away so the very first
        // `/keys/upload` carries device keys and one-time keys together.
        inner.generate_one_time_keys(inner.max_number_of_one_time_keys());

        let identity_keys = inner.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(inner),
            shared: false,
            uploaded_key_count: 0,
        }
    }

    /// Restore an account from its pickled form.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let inner = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys = inner.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: pickle.user_id,
                device_id: pickle.device_id,
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(inner),
            shared: pickle.shared,
            uploaded_key_count: pickle.uploaded_signed_key_count,
        }
    }

    /// Pickle the account for storage.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle: self.inner.pickle(),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_key_count,
        }
    }

    /// The immutable identity data of the account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// The user id of the account owner.
    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    /// The id of this device.
    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    /// The long-term identity keys of this device.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.static_data.identity_keys
    }

    /// Has the account been uploaded to the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as uploaded.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Mark the currently generated one-time keys as published.
    ///
    /// Keys must only be marked published once the server acknowledged the
    /// upload, otherwise they'd be lost forever.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Update the uploaded one-time key count from a server response or sync
    /// and replenish the pool if it dropped below the target.
    ///
    /// Returns `true` if new keys were generated and an upload is needed.
    pub fn update_key_counts(&mut self, count: u64) -> bool {
        if count != self.uploaded_key_count {
            debug!(old = self.uploaded_key_count, new = count, "Updated one-time key count");
        }
        self.uploaded_key_count = count;

        self.generate_one_time_keys_if_needed()
    }

    /// Generate one-time keys if the server-side pool is running low.
    pub fn generate_one_time_keys_if_needed(&mut self) -> bool {
        // Unpublished keys may be left over from a failed upload; offer them
        // again instead of generating more.
        if !self.inner.one_time_keys().is_empty() {
            return true;
        }

        if self.uploaded_key_count >= TARGET_ONE_TIME_KEY_COUNT {
            return false;
        }

        let missing = (TARGET_ONE_TIME_KEY_COUNT - self.uploaded_key_count) as usize;
        let max = self.inner.max_number_of_one_time_keys();
        let result = self.inner.generate_one_time_keys(missing.min(max));

        debug!(
            created = result.created.len(),
            discarded = result.removed.len(),
            "Generated new one-time keys"
        );

        true
    }

    /// Explicitly generate `count` one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    /// Should the device keys or fresh one-time keys be uploaded.
    pub fn should_upload_keys(&self) -> bool {
        !self.shared || !self.inner.one_time_keys().is_empty()
    }

    /// The signed device keys for a `/keys/upload` request.
    pub fn device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();

        let mut device_keys = DeviceKeys {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            algorithms: vec![OLM_V1_ALGORITHM.to_owned(), MEGOLM_V1_ALGORITHM.to_owned()],
            keys: BTreeMap::from([
                (
                    format!("curve25519:{}", self.device_id()),
                    identity_keys.curve25519.to_base64(),
                ),
                (format!("ed25519:{}", self.device_id()), identity_keys.ed25519.to_base64()),
            ]),
            signatures: Default::default(),
            unsigned: None,
        };

        let signature = self
            .inner
            .sign_json(&device_keys)
            .expect("Newly created device keys can always be signed");

        device_keys
            .signatures
            .entry(self.user_id().to_owned())
            .or_default()
            .insert(format!("ed25519:{}", self.device_id()), signature.to_base64());

        device_keys
    }

    /// Our own device keys wrapped up as device data, marked as verified.
    pub fn own_device_data(&self) -> DeviceData {
        let mut device = DeviceData::new(self.device_keys());
        device.local_trust = crate::LocalTrust::Verified;
        device
    }

    /// Sign and prepare the unpublished one-time keys for upload.
    ///
    /// Each key is signed with the device Ed25519 key over its canonical
    /// JSON form. Returns an empty map if no keys need to be uploaded.
    pub fn signed_one_time_keys(&self) -> OneTimeKeys {
        let mut keys_map = BTreeMap::new();

        for (key_id, key) in self.inner.one_time_keys() {
            let mut signed_key = SignedKey::new(key);

            let signature = self
                .inner
                .sign_json(&signed_key)
                .expect("Newly created one-time keys can always be signed");

            signed_key
                .signatures
                .entry(self.user_id().to_owned())
                .or_default()
                .insert(format!("ed25519:{}", self.device_id()), signature.to_base64());

            keys_map
                .insert(format!("{SIGNED_CURVE25519}:{}", key_id.to_base64()), signed_key);
        }

        keys_map
    }

    /// Sign the canonical JSON form of an arbitrary value with the device
    /// Ed25519 key.
    pub fn sign_json(
        &self,
        value: &impl Serialize,
    ) -> Result<vodozemac::Ed25519Signature, SignatureError> {
        self.inner.sign_json(value)
    }

    /// Create a new outbound Olm session with another device, consuming one
    /// of its claimed one-time keys.
    ///
    /// The signature of the one-time key is checked against the device's
    /// Ed25519 key before the session is created.
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        one_time_keys: &BTreeMap<String, SignedKey>,
    ) -> Result<Session, SessionCreationError> {
        let (_, one_time_key) = one_time_keys.iter().next().ok_or_else(|| {
            SessionCreationError::OneTimeKeyMissing(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        device.verify_one_time_key(one_time_key).map_err(|e| {
            SessionCreationError::InvalidSignature(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                Box::new(e),
            )
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let one_time_key = one_time_key.curve25519_key()?;

        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        trace!(
            user_id = ?device.user_id(),
            device_id = ?device.device_id(),
            session_id = session.session_id(),
            "Created a new outbound Olm session"
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Ok(Session {
            user_id: device.user_id().to_owned(),
            device_id: device.device_id().to_owned(),
            our_identity_keys: self.static_data.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            creation_time: now,
            last_use_time: now,
        })
    }

    /// Create an inbound Olm session from a received prekey message.
    ///
    /// This consumes the matching one-time key; vodozemac removes it from
    /// the pool atomically, so the same prekey message can never create a
    /// second session.
    pub fn create_inbound_session(
        &mut self,
        sender: &UserId,
        sender_device: Option<&DeviceId>,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, String), SessionCreationError> {
        trace!(session_id = message.session_id(), "Creating a new inbound Olm session");

        let result = self.inner.create_inbound_session(sender_key, message)?;

        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        let session = Session {
            user_id: sender.to_owned(),
            device_id: sender_device.map(|d| d.to_owned()).unwrap_or_else(|| "".into()),
            our_identity_keys: self.static_data.identity_keys.clone(),
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok((session, plaintext))
    }

    /// Decrypt an Olm message, trying the cached sessions for the sender
    /// first, oldest compatible first, before falling back to creating a new
    /// inbound session for prekey messages.
    ///
    /// Returns the session that decrypted the message (so it can be
    /// persisted with its advanced ratchet state), the plaintext and whether
    /// the session is new.
    pub async fn decrypt_olm_message(
        &mut self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
        existing_sessions: Vec<Session>,
    ) -> Result<(Session, String, bool), OlmError> {
        for mut session in existing_sessions {
            match session.decrypt(message).await {
                Ok(plaintext) => return Ok((session, plaintext, false)),
                // Wrong session, try the next one.
                Err(_) => continue,
            }
        }

        match message {
            OlmMessage::PreKey(prekey) => {
                let (session, plaintext) =
                    self.create_inbound_session(sender, None, sender_key, prekey)?;

                Ok((session, plaintext, true))
            }
            OlmMessage::Normal(_) => {
                // A normal message that none of our sessions could decrypt;
                // the sender is using a session we lost or never had.
                Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use vodozemac::olm::OlmMessage;

    use super::{Account, OlmMessageHash};

    #[test]
    fn new_account_has_one_time_keys_to_upload() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));

        assert!(account.should_upload_keys());
        let one_time_keys = account.signed_one_time_keys();
        assert!(!one_time_keys.is_empty());

        for (key_id, key) in &one_time_keys {
            assert!(key_id.starts_with("signed_curve25519:"));
            assert!(key.signatures.contains_key(user_id!("@alice:localhost")));
        }
    }

    #[test]
    fn key_count_update_replenishes_the_pool() {
        let mut account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));

        account.mark_keys_as_published();
        account.mark_as_shared();
        assert!(account.signed_one_time_keys().is_empty());

        // The server ate most of our keys.
        assert!(account.update_key_counts(2));
        assert!(!account.signed_one_time_keys().is_empty());
    }

    #[test]
    fn pickle_round_trip_preserves_identity() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));
        let identity = account.identity_keys().clone();

        let restored = Account::from_pickle(account.pickle());

        assert_eq!(restored.identity_keys().curve25519, identity.curve25519);
        assert_eq!(restored.identity_keys().ed25519, identity.ed25519);
        assert_eq!(restored.user_id(), user_id!("@alice:localhost"));
    }

    #[tokio::test]
    async fn olm_round_trip_and_replay_hash() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));
        let mut bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let bob_device = bob.own_device_data();
        let one_time_keys = bob.signed_one_time_keys();

        let session = alice
            .create_outbound_session(&bob_device, &one_time_keys)
            .expect("Alice should be able to create a session using Bob's one-time key");

        let mut session = session;
        let message = session.encrypt_raw("it's a secret to everybody").await;
        let hash = OlmMessageHash::new(bob_device.curve25519_key().unwrap(), &message);

        let (_, plaintext, created) = bob
            .decrypt_olm_message(
                user_id!("@alice:localhost"),
                alice.identity_keys().curve25519,
                &message,
                Vec::new(),
            )
            .await
            .expect("Bob should decrypt the prekey message");

        assert!(created);
        assert_eq!(plaintext, "it's a secret to everybody");
        assert_eq!(hash, OlmMessageHash::new(bob_device.curve25519_key().unwrap(), &message));

        // The same prekey message fed in again must not create yet another
        // session, the one-time key is gone.
        match message {
            OlmMessage::PreKey(ref prekey) => {
                bob.create_inbound_session(
                    user_id!("@alice:localhost"),
                    None,
                    alice.identity_keys().curve25519,
                    prekey,
                )
                .expect_err("The consumed one-time key must not be usable twice");
            }
            OlmMessage::Normal(_) => panic!("The first message must be a prekey message"),
        }
    }
}
