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

//! The state machine tying the account, sessions, verification and backup
//! together.
//!
//! The machine is transport-agnostic: it consumes parsed response bodies
//! and sync sections, and produces request values for the caller to send.
//! Every mutating operation reads state from the store, advances it and
//! persists it back before the result is released; a ratchet state is never
//! used twice across a persist boundary.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::{olm::IdentityKeys, Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    backups::BackupMachine,
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    olm::{
        Account, EncryptionSettings, InboundGroupSession, OlmMessageHash,
        OutboundGroupSession, PrivateCrossSigningIdentity, Session, StaticAccountData,
    },
    requests::{
        AnyOutgoingRequest, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, OutgoingRequest,
        SigningKeysUploadRequest, ToDeviceRequest,
    },
    store::{Changes, DeviceChanges, DynCryptoStore, PendingChanges},
    types::{
        events::{
            ForwardedRoomKeyContent, KeyRequestAction, MegolmEncryptedContent,
            MegolmPayload, OlmEncryptedContent, OlmPayload, RequestedKeyInfo, RoomKeyContent,
            RoomKeyRequestContent,
        },
        DeviceData, LocalTrust, MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM, SIGNED_CURVE25519,
    },
    verification::{AnyVerificationEvent, VerificationMachine, VerificationPolicy},
};

/// Repeated requests for the same room key are suppressed within this
/// window. Wall-clock based and advisory only; the server-side dedup of
/// transaction ids is the real guarantee.
const KEY_REQUEST_COOLDOWN: Duration = Duration::from_secs(60);

/// The `device_lists` section of a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users whose device list changed; cached keys must be re-queried.
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    /// Users we no longer share any encrypted room with.
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// The E2EE-relevant sections of one sync response.
#[derive(Debug, Clone, Default)]
pub struct SyncChanges {
    /// The raw to-device events.
    pub to_device_events: Vec<Value>,
    /// The device list deltas.
    pub device_lists: DeviceLists,
    /// The one-time key counts the server holds for us.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// A to-device event that was decrypted (or was plaintext) and is not
/// consumed by the engine itself.
#[derive(Debug, Clone)]
pub struct ProcessedToDeviceEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
    /// Whether the event arrived Olm-encrypted.
    pub encrypted: bool,
}

/// A successfully decrypted room event.
#[derive(Debug, Clone)]
pub struct DecryptedRoomEvent {
    /// The type of the embedded event.
    pub event_type: String,
    /// The decrypted content.
    pub content: Value,
    /// The Curve25519 key of the device that created the Megolm session.
    pub sender_key: String,
    /// The ratchet index the message was encrypted at.
    pub message_index: u32,
}

/// The result of processing a one-time key claim response.
#[derive(Debug, Clone, Default)]
pub struct SessionCreationSummary {
    /// The devices we now share a fresh Olm session with.
    pub created: Vec<(OwnedUserId, OwnedDeviceId)>,
    /// The devices that failed, with the reason; one bad device never
    /// blocks the rest.
    pub failed: Vec<(OwnedUserId, OwnedDeviceId, String)>,
}

/// The state machine for an account's end-to-end encryption.
#[derive(Clone)]
pub struct OlmMachine {
    static_data: StaticAccountData,
    account: Arc<Mutex<Account>>,
    store: Arc<DynCryptoStore>,
    outbound_group_sessions: Arc<StdMutex<HashMap<OwnedRoomId, OutboundGroupSession>>>,
    verification_machine: VerificationMachine,
    backup_machine: BackupMachine,
    outgoing_to_device: Arc<StdMutex<Vec<ToDeviceRequest>>>,
    key_request_times: Arc<StdMutex<HashMap<(OwnedRoomId, String), Instant>>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a machine for the given account, loading the long-term
    /// account from the store or creating and persisting a fresh one.
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<DynCryptoStore>,
        policy: VerificationPolicy,
    ) -> OlmResult<Self> {
        let account = match store.load_account().await? {
            Some(pickle) => {
                let account = Account::from_pickle(pickle);
                debug!(
                    ?user_id,
                    ?device_id,
                    "Restored the Olm account from the store"
                );
                account
            }
            None => {
                let account = Account::new(user_id, device_id);
                store
                    .save_pending_changes(PendingChanges { account: Some(account.pickle()) })
                    .await?;
                info!(?user_id, ?device_id, "Created a new Olm account");
                account
            }
        };

        let static_data = account.static_data().clone();

        // Our own device is trusted implicitly.
        let own_device = account.own_device_data();
        store
            .save_changes(Changes {
                devices: DeviceChanges { new: vec![own_device], ..Default::default() },
                ..Default::default()
            })
            .await?;

        let verification_machine =
            VerificationMachine::new(&static_data, store.clone(), policy);
        let backup_machine = BackupMachine::new(store.clone());

        Ok(Self {
            static_data,
            account: Arc::new(Mutex::new(account)),
            store,
            outbound_group_sessions: Default::default(),
            verification_machine,
            backup_machine,
            outgoing_to_device: Default::default(),
            key_request_times: Default::default(),
        })
    }

    /// The user this machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    /// The device this machine runs on.
    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    /// The long-term identity keys of this device.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.static_data.identity_keys
    }

    /// The verification state machine.
    pub fn verification_machine(&self) -> &VerificationMachine {
        &self.verification_machine
    }

    /// The backup state machine.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.backup_machine
    }

    /// The store this machine persists into.
    pub fn store(&self) -> &Arc<DynCryptoStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Key uploads and device tracking
    // ------------------------------------------------------------------

    /// Should a `/keys/upload` request be sent.
    pub async fn should_upload_keys(&self) -> bool {
        self.account.lock().await.should_upload_keys()
    }

    /// The `/keys/upload` request carrying the device keys and freshly
    /// signed one-time keys, if anything needs uploading.
    pub async fn keys_for_upload(&self) -> Option<KeysUploadRequest> {
        let account = self.account.lock().await;

        if !account.should_upload_keys() {
            return None;
        }

        let device_keys = (!account.shared()).then(|| account.device_keys());
        let one_time_keys = account.signed_one_time_keys();

        if device_keys.is_none() && one_time_keys.is_empty() {
            None
        } else {
            Some(KeysUploadRequest { device_keys, one_time_keys })
        }
    }

    /// Process the response to a `/keys/upload` request.
    ///
    /// Only now are the one-time keys marked as published; marking them
    /// before the acknowledgment would lose them on a failed upload.
    pub async fn receive_keys_upload_response(
        &self,
        response: &KeysUploadResponse,
    ) -> OlmResult<()> {
        let mut account = self.account.lock().await;

        if !account.shared() {
            debug!("Marking the account as shared");
        }
        account.mark_as_shared();
        account.mark_keys_as_published();

        let count = response
            .one_time_key_counts
            .get(SIGNED_CURVE25519)
            .copied()
            .unwrap_or_default();
        account.update_key_counts(count);

        self.store
            .save_pending_changes(PendingChanges { account: Some(account.pickle()) })
            .await?;

        Ok(())
    }

    /// Start tracking the given users' device lists.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        let users: Vec<_> = users.into_iter().map(|u| (u, true)).collect();
        self.store.save_tracked_users(&users).await?;

        Ok(())
    }

    /// Mark the given users' cached device keys as outdated.
    pub async fn mark_tracked_users_as_changed(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        self.update_tracked_users(users).await
    }

    /// The users whose device lists need re-querying, as a
    /// `/keys/query` request. `None` if everything is up to date.
    pub async fn users_for_key_query(&self) -> OlmResult<Option<KeysQueryRequest>> {
        let tracked = self.store.load_tracked_users().await?;

        let device_keys: HashMap<_, _> = tracked
            .into_iter()
            .filter(|u| u.dirty)
            .map(|u| (u.user_id, Vec::new()))
            .collect();

        Ok((!device_keys.is_empty()).then(|| KeysQueryRequest { device_keys }))
    }

    /// Process the response to a `/keys/query` request.
    ///
    /// Device keys that fail their self-signature check are rejected;
    /// existing local trust decisions survive key updates only if the
    /// Ed25519 key is unchanged.
    pub async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> OlmResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for (user_id, devices) in &response.device_keys {
            for (device_id, device_keys) in devices {
                if device_keys.user_id != *user_id || device_keys.device_id != *device_id {
                    warn!(
                        ?user_id,
                        ?device_id,
                        "The device keys don't match the requested user or device, ignoring"
                    );
                    continue;
                }

                let new_device = DeviceData::new(device_keys.clone());

                if let Err(e) = new_device.verify_self_signature() {
                    warn!(
                        ?user_id,
                        ?device_id,
                        error = ?e,
                        "The device keys failed the self-signature check, ignoring"
                    );
                    continue;
                }

                match self.store.get_device(user_id, device_id).await? {
                    Some(existing) => {
                        if existing.ed25519_key() != new_device.ed25519_key() {
                            warn!(
                                ?user_id,
                                ?device_id,
                                "The Ed25519 key of a device changed, resetting trust"
                            );
                            changes.changed.push(new_device);
                        } else {
                            let mut updated = new_device;
                            updated.local_trust = existing.local_trust;
                            changes.changed.push(updated);
                        }
                    }
                    None => changes.new.push(new_device),
                }
            }
        }

        let users: Vec<_> =
            response.device_keys.keys().map(|u| (u.as_ref(), false)).collect();

        self.store
            .save_changes(Changes { devices: changes.clone(), ..Default::default() })
            .await?;
        self.store.save_tracked_users(&users).await?;

        Ok(changes)
    }

    // ------------------------------------------------------------------
    // Olm sessions
    // ------------------------------------------------------------------

    async fn sessions_for_sender(&self, sender_key: &str) -> OlmResult<Vec<Session>> {
        let pickles = self.store.get_sessions(sender_key).await?;

        let mut sessions: Vec<_> = pickles
            .into_iter()
            .map(|p| Session::from_pickle(self.static_data.identity_keys.clone(), p))
            .collect();

        // Most recently created first for encryption; decryption attempts
        // run through the whole list anyway.
        sessions.sort_by_key(|s| std::cmp::Reverse(s.creation_time));

        Ok(sessions)
    }

    /// Do we have an Olm session with the given device.
    pub async fn has_session_with(&self, device: &DeviceData) -> OlmResult<bool> {
        let Some(sender_key) = device.curve25519_key() else {
            return Ok(false);
        };

        Ok(!self.store.get_sessions(&sender_key.to_base64()).await?.is_empty())
    }

    /// Build a `/keys/claim` request for all devices of the given users
    /// that we don't have an Olm session with yet.
    pub async fn get_missing_sessions(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<Option<KeysClaimRequest>> {
        let mut one_time_keys: HashMap<OwnedUserId, HashMap<OwnedDeviceId, String>> =
            HashMap::new();

        for user_id in users {
            for (device_id, device) in self.store.get_user_devices(user_id).await? {
                if user_id == self.user_id() && device_id == self.device_id() {
                    continue;
                }

                if device.is_blacklisted() {
                    continue;
                }

                if !self.has_session_with(&device).await? {
                    one_time_keys
                        .entry(user_id.to_owned())
                        .or_default()
                        .insert(device_id, SIGNED_CURVE25519.to_owned());
                }
            }
        }

        Ok((!one_time_keys.is_empty()).then(|| KeysClaimRequest { one_time_keys }))
    }

    /// Process the response to a `/keys/claim` request, creating outbound
    /// Olm sessions from the claimed one-time keys.
    pub async fn receive_keys_claim_response(
        &self,
        response: &KeysClaimResponse,
    ) -> OlmResult<SessionCreationSummary> {
        let mut summary = SessionCreationSummary::default();
        let mut changes = Changes::default();

        let account = self.account.lock().await;

        for (user_id, devices) in &response.one_time_keys {
            for (device_id, key_map) in devices {
                let device = match self.store.get_device(user_id, device_id).await? {
                    Some(device) => device,
                    None => {
                        warn!(
                            ?user_id,
                            ?device_id,
                            "Claimed a one-time key for a device we don't know about"
                        );
                        summary.failed.push((
                            user_id.clone(),
                            device_id.clone(),
                            "unknown device".to_owned(),
                        ));
                        continue;
                    }
                };

                match account.create_outbound_session(&device, key_map) {
                    Ok(session) => {
                        changes.sessions.push(session.pickle().await);
                        summary.created.push((user_id.clone(), device_id.clone()));
                    }
                    Err(e) => {
                        warn!(
                            ?user_id,
                            ?device_id,
                            error = ?e,
                            "Failed to create an Olm session from a claimed one-time key"
                        );
                        summary.failed.push((user_id.clone(), device_id.clone(), e.to_string()));
                    }
                }
            }
        }

        if !changes.sessions.is_empty() {
            self.store.save_changes(changes).await?;
        }

        info!(
            created = summary.created.len(),
            failed = summary.failed.len(),
            "Processed a one-time key claim response"
        );

        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Sync processing
    // ------------------------------------------------------------------

    /// Process the E2EE parts of a sync response, in the fixed order:
    /// device-list deltas, one-time key counts, then the to-device events.
    ///
    /// Returns the decrypted events that are not consumed by the engine
    /// itself.
    #[instrument(skip_all)]
    pub async fn receive_sync_changes(
        &self,
        changes: SyncChanges,
    ) -> OlmResult<Vec<ProcessedToDeviceEvent>> {
        // (a) Invalidate cached device keys.
        if !changes.device_lists.changed.is_empty() {
            self.mark_tracked_users_as_changed(
                changes.device_lists.changed.iter().map(|u| u.as_ref()),
            )
            .await?;
        }

        if !changes.device_lists.left.is_empty() {
            // Stale cached devices of left users are harmless, they just
            // stop being refreshed.
            trace!(users = ?changes.device_lists.left, "Users left all shared encrypted rooms");
        }

        // (b) Replenish the one-time key pool if the server runs low.
        if let Some(count) = changes.one_time_key_counts.get(SIGNED_CURVE25519) {
            let mut account = self.account.lock().await;
            account.update_key_counts(*count);
            self.store
                .save_pending_changes(PendingChanges { account: Some(account.pickle()) })
                .await?;
        }

        // (c) Route the to-device events.
        let mut processed = Vec::new();

        for event in changes.to_device_events {
            match self.receive_to_device_event(&event).await {
                Ok(Some(event)) => processed.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = ?e, "Failed to process a to-device event");
                }
            }
        }

        Ok(processed)
    }

    async fn receive_to_device_event(
        &self,
        event: &Value,
    ) -> OlmResult<Option<ProcessedToDeviceEvent>> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let sender = event
            .get("sender")
            .and_then(Value::as_str)
            .and_then(|s| UserId::parse(s).ok());
        let content = event.get("content").cloned().unwrap_or(Value::Null);

        let Some(sender) = sender else {
            warn!(event_type, "Received a to-device event without a valid sender");
            return Ok(None);
        };

        match event_type {
            "m.room.encrypted" => {
                let content: OlmEncryptedContent = serde_json::from_value(content)?;
                self.receive_encrypted_to_device(&sender, &content).await
            }
            "m.room_key_request" => {
                let content: RoomKeyRequestContent = serde_json::from_value(content)?;
                self.receive_room_key_request(&sender, &content);
                Ok(None)
            }
            _ => {
                if let Some(event) =
                    AnyVerificationEvent::from_to_device(event_type, &content)
                {
                    match event {
                        Ok(event) => {
                            self.verification_machine.receive_any_event(&sender, &event).await?;
                        }
                        Err(e) => {
                            warn!(event_type, error = %e, "Received a malformed verification event");
                        }
                    }
                    Ok(None)
                } else {
                    Ok(Some(ProcessedToDeviceEvent {
                        sender,
                        event_type: event_type.to_owned(),
                        content,
                        encrypted: false,
                    }))
                }
            }
        }
    }

    async fn receive_encrypted_to_device(
        &self,
        sender: &UserId,
        content: &OlmEncryptedContent,
    ) -> OlmResult<Option<ProcessedToDeviceEvent>> {
        if content.algorithm != OLM_V1_ALGORITHM {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let own_key = self.static_data.identity_keys.curve25519.to_base64();
        let Some(ciphertext) = content.ciphertext.get(&own_key) else {
            return Err(EventError::MissingCiphertext.into());
        };

        let sender_key = Curve25519PublicKey::from_base64(&content.sender_key)
            .map_err(|_| EventError::MissingSigningKey)?;

        // Replay protection: an already-seen message must never advance a
        // ratchet a second time.
        let message_hash = OlmMessageHash::new(sender_key, ciphertext);
        if self.store.is_message_known(&message_hash).await? {
            return Err(OlmError::ReplayedMessage(sender.to_owned(), sender_key));
        }

        let existing_sessions = self.sessions_for_sender(&content.sender_key).await?;

        let mut account = self.account.lock().await;
        let (session, plaintext, created) = account
            .decrypt_olm_message(sender, sender_key, ciphertext, existing_sessions)
            .await?;

        // Persist the account first when a one-time key was consumed, then
        // the advanced session and the replay hash.
        if created {
            self.store
                .save_pending_changes(PendingChanges { account: Some(account.pickle()) })
                .await?;
        }
        drop(account);

        self.store
            .save_changes(Changes {
                sessions: vec![session.pickle().await],
                message_hashes: vec![message_hash],
                ..Default::default()
            })
            .await?;

        let payload: OlmPayload = serde_json::from_str(&plaintext)?;
        self.check_olm_payload(sender, &payload)?;

        self.receive_decrypted_payload(sender, &content.sender_key, payload).await
    }

    /// Check the binding fields of a decrypted Olm payload.
    fn check_olm_payload(&self, sender: &UserId, payload: &OlmPayload) -> OlmResult<()> {
        if payload.sender != sender {
            return Err(EventError::MismatchedSender(
                payload.sender.clone(),
                sender.to_owned(),
            )
            .into());
        }

        if payload.recipient != self.user_id() {
            return Err(EventError::MismatchedSender(
                payload.recipient.clone(),
                self.user_id().to_owned(),
            )
            .into());
        }

        let own_ed25519 = self.static_data.identity_keys.ed25519;
        match payload
            .recipient_keys
            .get("ed25519")
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
        {
            Some(key) if key == own_ed25519 => Ok(()),
            Some(key) => {
                Err(EventError::MismatchedKeys(Box::new(own_ed25519), Box::new(key)).into())
            }
            None => Err(EventError::MissingSigningKey.into()),
        }
    }

    async fn receive_decrypted_payload(
        &self,
        sender: &UserId,
        sender_key: &str,
        payload: OlmPayload,
    ) -> OlmResult<Option<ProcessedToDeviceEvent>> {
        match payload.event_type.as_str() {
            "m.room_key" => {
                let content: RoomKeyContent = serde_json::from_value(payload.content)?;
                let claimed_ed25519 = payload.keys.get("ed25519").map(String::as_str);
                self.receive_room_key(sender_key, claimed_ed25519, &content).await?;
                Ok(None)
            }
            "m.forwarded_room_key" => {
                let content: ForwardedRoomKeyContent =
                    serde_json::from_value(payload.content)?;
                self.receive_forwarded_room_key(sender_key, &content).await?;
                Ok(None)
            }
            _ => {
                if let Some(event) = AnyVerificationEvent::from_to_device(
                    &payload.event_type,
                    &payload.content,
                ) {
                    match event {
                        Ok(event) => {
                            self.verification_machine.receive_any_event(sender, &event).await?;
                        }
                        Err(e) => {
                            warn!(
                                event_type = payload.event_type,
                                error = %e,
                                "Received a malformed encrypted verification event"
                            );
                        }
                    }
                    Ok(None)
                } else {
                    Ok(Some(ProcessedToDeviceEvent {
                        sender: sender.to_owned(),
                        event_type: payload.event_type,
                        content: payload.content,
                        encrypted: true,
                    }))
                }
            }
        }
    }

    async fn receive_room_key(
        &self,
        sender_key: &str,
        claimed_ed25519: Option<&str>,
        content: &RoomKeyContent,
    ) -> OlmResult<()> {
        if content.algorithm != MEGOLM_V1_ALGORITHM {
            warn!(algorithm = content.algorithm, "Received a room key with an unsupported algorithm");
            return Ok(());
        }

        let session =
            match InboundGroupSession::from_room_key(sender_key, claimed_ed25519, content) {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Received an invalid room key");
                    return Ok(());
                }
            };

        info!(
            room_id = ?content.room_id,
            session_id = content.session_id,
            "Received a new Megolm room key"
        );

        self.store
            .save_changes(Changes {
                inbound_group_sessions: vec![session.pickle().await],
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    async fn receive_forwarded_room_key(
        &self,
        forwarding_device_key: &str,
        content: &ForwardedRoomKeyContent,
    ) -> OlmResult<()> {
        let session =
            match InboundGroupSession::from_forwarded_key(forwarding_device_key, content) {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Received an invalid forwarded room key");
                    return Ok(());
                }
            };

        // Never let a forwarded key shadow a directly received one; a
        // directly received session starts at an index at least as early.
        if self
            .store
            .get_inbound_group_session(&content.room_id, &content.session_id)
            .await?
            .is_none()
        {
            info!(
                room_id = ?content.room_id,
                session_id = content.session_id,
                "Received a forwarded Megolm room key"
            );

            self.store
                .save_changes(Changes {
                    inbound_group_sessions: vec![session.pickle().await],
                    ..Default::default()
                })
                .await?;
        }

        Ok(())
    }

    fn receive_room_key_request(&self, sender: &UserId, content: &RoomKeyRequestContent) {
        // Forwarding keys to requesting devices is deliberately not
        // implemented; requests are only logged so operators can see them.
        match content.action {
            KeyRequestAction::Request => {
                debug!(
                    ?sender,
                    requesting_device = ?content.requesting_device_id,
                    session = ?content.body.as_ref().map(|b| b.session_id.as_str()),
                    "Received a room key request, not answering"
                );
            }
            KeyRequestAction::RequestCancellation => {
                trace!(?sender, request_id = content.request_id, "A room key request was cancelled");
            }
        }
    }

    // ------------------------------------------------------------------
    // Megolm encryption
    // ------------------------------------------------------------------

    async fn get_or_load_outbound_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>, crate::store::CryptoStoreError> {
        if let Some(session) = self.outbound_group_sessions.lock().unwrap().get(room_id) {
            return Ok(Some(session.clone()));
        }

        let Some(pickle) = self.store.get_outbound_group_session(room_id).await? else {
            return Ok(None);
        };

        let session = OutboundGroupSession::from_pickle(pickle);
        self.outbound_group_sessions
            .lock()
            .unwrap()
            .insert(room_id.to_owned(), session.clone());

        Ok(Some(session))
    }

    /// Create a fresh outbound group session for the room and the
    /// to-device requests distributing its key to every verified-or-unverified
    /// (but not blacklisted) device of the given users over Olm.
    ///
    /// Devices we have no Olm session with are skipped and logged; run the
    /// key claim flow first to minimize those.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: impl IntoIterator<Item = &UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<ToDeviceRequest>> {
        let outbound = OutboundGroupSession::new(room_id, settings);
        let room_key = outbound.as_room_key_content().await;

        // Keep an inbound copy so we can decrypt our own messages and back
        // the key up.
        let own_key = self.static_data.identity_keys.curve25519.to_base64();
        let own_ed25519 = self.static_data.identity_keys.ed25519.to_base64();
        let inbound =
            InboundGroupSession::from_room_key(&own_key, Some(&own_ed25519), &room_key)
                .expect("A freshly created session key can always be imported");

        let mut changes = Changes {
            outbound_group_sessions: vec![outbound.pickle().await],
            inbound_group_sessions: vec![inbound.pickle().await],
            ..Default::default()
        };

        let mut requests: Vec<ToDeviceRequest> = Vec::new();
        let mut skipped = 0usize;

        for user_id in users {
            for (device_id, device) in self.store.get_user_devices(user_id).await? {
                if user_id == self.user_id() && device_id == self.device_id() {
                    continue;
                }

                if device.is_blacklisted() {
                    continue;
                }

                let Some(sender_key) = device.curve25519_key() else {
                    skipped += 1;
                    continue;
                };

                let sessions = self.sessions_for_sender(&sender_key.to_base64()).await?;
                let Some(mut session) = sessions.into_iter().next() else {
                    debug!(
                        ?user_id,
                        ?device_id,
                        "No Olm session with the device, skipping it for the room key share"
                    );
                    skipped += 1;
                    continue;
                };

                let content = session
                    .encrypt(
                        &self.static_data,
                        &device,
                        "m.room_key",
                        serde_json::to_value(&room_key)?,
                    )
                    .await?;

                changes.sessions.push(session.pickle().await);

                requests.push(ToDeviceRequest::new(
                    user_id.to_owned(),
                    device_id,
                    "m.room.encrypted",
                    serde_json::to_value(content)?,
                ));
            }
        }

        self.store.save_changes(changes).await?;
        self.outbound_group_sessions
            .lock()
            .unwrap()
            .insert(room_id.to_owned(), outbound);

        info!(
            ?room_id,
            shared_with = requests.len(),
            skipped,
            "Created and shared a new Megolm session"
        );

        Ok(requests)
    }

    /// Is there a usable outbound group session for the room.
    pub async fn should_share_group_session(&self, room_id: &RoomId) -> OlmResult<bool> {
        match self.get_or_load_outbound_session(room_id).await? {
            Some(session) => Ok(!session.is_usable()),
            None => Ok(true),
        }
    }

    /// Invalidate the outbound group session of the room, e.g. on a
    /// membership change.
    pub async fn invalidate_group_session(&self, room_id: &RoomId) -> OlmResult<bool> {
        if let Some(session) = self.get_or_load_outbound_session(room_id).await? {
            session.invalidate();
            self.store
                .save_changes(Changes {
                    outbound_group_sessions: vec![session.pickle().await],
                    ..Default::default()
                })
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Encrypt a room event with the room's outbound group session.
    ///
    /// Calling this without having created and shared a session first is a
    /// contract violation and fails hard, it never silently creates an
    /// unshared session.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<MegolmEncryptedContent> {
        let Some(session) = self.get_or_load_outbound_session(room_id).await? else {
            return Err(MegolmError::MissingOutboundSession(room_id.to_owned()));
        };

        let encrypted = session.encrypt(event_type, content).await?;

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![session.pickle().await],
                ..Default::default()
            })
            .await?;

        Ok(encrypted)
    }

    /// Decrypt an `m.room.encrypted` room event.
    ///
    /// An unknown session yields [`MegolmError::MissingRoomKey`] and queues
    /// a rate-limited `m.room_key_request` towards our own devices.
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        content: &MegolmEncryptedContent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        if content.algorithm != MEGOLM_V1_ALGORITHM {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let Some(pickle) =
            self.store.get_inbound_group_session(room_id, &content.session_id).await?
        else {
            self.request_room_key(room_id, &content.session_id);
            return Err(MegolmError::MissingRoomKey);
        };

        let session = InboundGroupSession::from_pickle(pickle);
        let decrypted = session.decrypt(&content.ciphertext).await?;

        // Persist the advanced ratchet before handing out the plaintext.
        self.store
            .save_changes(Changes {
                inbound_group_sessions: vec![session.pickle().await],
                ..Default::default()
            })
            .await?;

        let payload: MegolmPayload = serde_json::from_slice(&decrypted.plaintext)?;

        if payload.room_id != room_id {
            return Err(EventError::MismatchedRoom(
                room_id.to_owned(),
                Some(payload.room_id),
            )
            .into());
        }

        Ok(DecryptedRoomEvent {
            event_type: payload.event_type,
            content: payload.content,
            sender_key: session.sender_key.clone(),
            message_index: decrypted.message_index,
        })
    }

    /// Queue an `m.room_key_request` for the given session towards our own
    /// devices, unless one was sent within the cooldown window.
    pub fn request_room_key(&self, room_id: &RoomId, session_id: &str) {
        let key = (room_id.to_owned(), session_id.to_owned());
        let mut times = self.key_request_times.lock().unwrap();

        if let Some(last) = times.get(&key) {
            if last.elapsed() < KEY_REQUEST_COOLDOWN {
                trace!(
                    ?room_id,
                    session_id,
                    "Not requesting a room key, a request was sent recently"
                );
                return;
            }
        }
        times.insert(key, Instant::now());

        let content = RoomKeyRequestContent {
            action: KeyRequestAction::Request,
            body: Some(RequestedKeyInfo {
                algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
                room_id: room_id.to_owned(),
                session_id: session_id.to_owned(),
                sender_key: None,
            }),
            requesting_device_id: self.device_id().to_owned(),
            request_id: TransactionId::new().to_string(),
        };

        info!(?room_id, session_id, "Requesting a missing room key from our own devices");

        let request = ToDeviceRequest::new(
            self.user_id().to_owned(),
            "*".into(),
            "m.room_key_request",
            serde_json::to_value(content).expect("The key request content serializes"),
        );

        self.outgoing_to_device.lock().unwrap().push(request);
    }

    // ------------------------------------------------------------------
    // Outgoing request collection
    // ------------------------------------------------------------------

    /// Collect everything that should be sent to the homeserver right now.
    pub async fn outgoing_requests(&self) -> OlmResult<Vec<OutgoingRequest>> {
        let mut requests = Vec::new();

        if let Some(upload) = self.keys_for_upload().await {
            requests.push(OutgoingRequest {
                request_id: TransactionId::new(),
                request: AnyOutgoingRequest::KeysUpload(upload),
            });
        }

        if let Some(query) = self.users_for_key_query().await? {
            requests.push(OutgoingRequest {
                request_id: TransactionId::new(),
                request: AnyOutgoingRequest::KeysQuery(query),
            });
        }

        for request in self.verification_machine.outgoing_requests() {
            requests.push(OutgoingRequest {
                request_id: TransactionId::new(),
                request: AnyOutgoingRequest::ToDevice(ToDeviceRequest::new(
                    request.to_user_id,
                    request.to_device_id,
                    &request.event_type,
                    request.content,
                )),
            });
        }

        for request in std::mem::take(&mut *self.outgoing_to_device.lock().unwrap()) {
            requests.push(OutgoingRequest {
                request_id: TransactionId::new(),
                request: AnyOutgoingRequest::ToDevice(request),
            });
        }

        Ok(requests)
    }

    // ------------------------------------------------------------------
    // Trust and cross-signing
    // ------------------------------------------------------------------

    /// Set the local trust state of a device.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> OlmResult<bool> {
        let Some(mut device) = self.store.get_device(user_id, device_id).await? else {
            return Ok(false);
        };

        device.local_trust = trust;
        self.store
            .save_changes(Changes {
                devices: DeviceChanges { changed: vec![device], ..Default::default() },
                ..Default::default()
            })
            .await?;

        Ok(true)
    }

    /// Load or create the private cross-signing identity and build the
    /// upload request for its public keys.
    ///
    /// Idempotent: an existing identity is reused, not regenerated.
    pub async fn bootstrap_cross_signing(
        &self,
    ) -> OlmResult<SigningKeysUploadRequest> {
        let identity = match self.store.load_cross_signing_identity().await? {
            Some(pickle) => PrivateCrossSigningIdentity::from_pickle(&pickle)
                .map_err(crate::store::CryptoStoreError::from)?,
            None => {
                let identity = PrivateCrossSigningIdentity::new(self.user_id().to_owned());
                self.store
                    .save_changes(Changes {
                        private_identity: Some(identity.pickle()),
                        ..Default::default()
                    })
                    .await?;
                info!("Created a new private cross-signing identity");
                identity
            }
        };

        let request = identity
            .as_upload_request()
            .map_err(|_| OlmError::EventError(EventError::MissingSigningKey))?;

        Ok(request)
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use ruma::{device_id, user_id, DeviceId, UserId};

    use super::OlmMachine;
    use crate::{
        store::IntoCryptoStore, verification::VerificationPolicy, MemoryStore,
    };

    pub(crate) fn alice_id() -> (&'static UserId, &'static DeviceId) {
        (user_id!("@alice:localhost"), device_id!("ALICEDEV"))
    }

    pub(crate) fn bob_id() -> (&'static UserId, &'static DeviceId) {
        (user_id!("@bob:localhost"), device_id!("BOBDEVICE"))
    }

    pub(crate) async fn machine(user_id: &UserId, device_id: &DeviceId) -> OlmMachine {
        OlmMachine::new(
            user_id,
            device_id,
            MemoryStore::new().into_crypto_store(),
            VerificationPolicy::AutoAccept,
        )
        .await
        .expect("We can always create a machine with a memory store")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use serde_json::json;

    use super::test_helpers::{alice_id, bob_id, machine};
    use crate::{error::MegolmError, olm::EncryptionSettings, types::events::MegolmEncryptedContent};

    #[tokio::test]
    async fn fresh_machine_wants_to_upload_keys() {
        let (user_id, device_id) = alice_id();
        let machine = machine(user_id, device_id).await;

        assert!(machine.should_upload_keys().await);

        let request = machine.keys_for_upload().await.expect("There should be keys to upload");
        assert!(request.device_keys.is_some());
        assert!(!request.one_time_keys.is_empty());
    }

    #[tokio::test]
    async fn upload_response_marks_keys_published() {
        let (user_id, device_id) = alice_id();
        let machine = machine(user_id, device_id).await;

        let request = machine.keys_for_upload().await.unwrap();
        let uploaded = request.one_time_keys.len() as u64;

        machine
            .receive_keys_upload_response(&crate::requests::KeysUploadResponse {
                one_time_key_counts: [("signed_curve25519".to_owned(), uploaded)].into(),
            })
            .await
            .unwrap();

        let request = machine.keys_for_upload().await;
        assert!(request.is_none(), "Nothing is left to upload after the acknowledgment");
    }

    #[tokio::test]
    async fn encrypting_without_a_session_is_a_hard_failure() {
        let (user_id, device_id) = alice_id();
        let machine = machine(user_id, device_id).await;

        let result = machine
            .encrypt_room_event(
                room_id!("!room:localhost"),
                "m.room.message",
                json!({"body": "hi"}),
            )
            .await;

        assert_matches!(result, Err(MegolmError::MissingOutboundSession(_)));
    }

    #[tokio::test]
    async fn decrypting_with_an_unknown_session_requests_the_key() {
        let (user_id, device_id) = alice_id();
        let machine = machine(user_id, device_id).await;
        let room_id = room_id!("!room:localhost");

        // A real ciphertext, but from a session this machine never saw.
        let (bob_user, bob_device) = bob_id();
        let other = super::test_helpers::machine(bob_user, bob_device).await;
        other
            .share_room_key(room_id, [bob_user], EncryptionSettings::default())
            .await
            .unwrap();
        let content: MegolmEncryptedContent = other
            .encrypt_room_event(room_id, "m.room.message", json!({"body": "unreadable"}))
            .await
            .unwrap();
        let result = machine.decrypt_room_event(room_id, &content).await;
        assert_matches!(result, Err(MegolmError::MissingRoomKey));

        // The failed decrypt queued exactly one key request; a second
        // attempt within the cooldown window queues nothing.
        let _ = machine.decrypt_room_event(room_id, &content).await;

        let requests = machine.outgoing_requests().await.unwrap();
        let key_requests: Vec<_> = requests
            .iter()
            .filter(|r| {
                matches!(
                    &r.request,
                    crate::requests::AnyOutgoingRequest::ToDevice(r)
                        if r.event_type == "m.room_key_request"
                )
            })
            .collect();

        assert_eq!(key_requests.len(), 1);
    }

    #[tokio::test]
    async fn own_room_key_share_allows_decrypting_own_messages() {
        let (user_id, device_id) = alice_id();
        let machine = machine(user_id, device_id).await;
        let room_id = room_id!("!room:localhost");

        // No other devices known, so no to-device requests result, but the
        // outbound session and our own inbound copy must exist.
        let requests = machine
            .share_room_key(room_id, [user_id], EncryptionSettings::default())
            .await
            .unwrap();
        assert!(requests.is_empty());

        let encrypted = machine
            .encrypt_room_event(room_id, "m.room.message", json!({"body": "hello"}))
            .await
            .unwrap();

        let decrypted = machine.decrypt_room_event(room_id, &encrypted).await.unwrap();
        assert_eq!(decrypted.event_type, "m.room.message");
        assert_eq!(decrypted.content, json!({"body": "hello"}));
        assert_eq!(decrypted.message_index, 0);
    }

    #[tokio::test]
    async fn two_machines_can_exchange_encrypted_room_messages() {
        let (alice_user, alice_device) = alice_id();
        let (bob_user, bob_device) = bob_id();

        let alice = machine(alice_user, alice_device).await;
        let bob = machine(bob_user, bob_device).await;

        connect(&alice, &bob).await;

        let room_id = room_id!("!room:localhost");
        let requests = alice
            .share_room_key(room_id, [bob_user], EncryptionSettings::default())
            .await
            .unwrap();
        assert_eq!(requests.len(), 1, "Alice should share the room key with Bob's device");

        // Deliver the room key to Bob as a to-device event.
        let request = &requests[0];
        let content = request.messages[bob_user][bob_device].clone();

        let processed = bob
            .receive_sync_changes(crate::machine::SyncChanges {
                to_device_events: vec![json!({
                    "sender": alice_user,
                    "type": "m.room.encrypted",
                    "content": content,
                })],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(processed.is_empty(), "The room key is consumed by the engine");

        let encrypted = alice
            .encrypt_room_event(room_id, "m.room.message", json!({"body": "hey bob"}))
            .await
            .unwrap();

        let decrypted = bob.decrypt_room_event(room_id, &encrypted).await.unwrap();
        assert_eq!(decrypted.content, json!({"body": "hey bob"}));
    }

    /// Make two machines aware of each other's devices and give the first
    /// an Olm session with the second.
    async fn connect(alice: &super::OlmMachine, bob: &super::OlmMachine) {
        use std::collections::HashMap;

        // Exchange device keys.
        let bob_keys = bob.keys_for_upload().await.unwrap();
        let alice_keys = alice.keys_for_upload().await.unwrap();

        let mut bob_devices = HashMap::new();
        bob_devices
            .insert(bob.device_id().to_owned(), bob_keys.device_keys.clone().unwrap());
        let mut alice_devices = HashMap::new();
        alice_devices
            .insert(alice.device_id().to_owned(), alice_keys.device_keys.clone().unwrap());

        let response = crate::requests::KeysQueryResponse {
            device_keys: [
                (bob.user_id().to_owned(), bob_devices),
                (alice.user_id().to_owned(), alice_devices),
            ]
            .into(),
            ..Default::default()
        };

        alice.receive_keys_query_response(&response).await.unwrap();
        bob.receive_keys_query_response(&response).await.unwrap();

        // Hand one of Bob's one-time keys to Alice.
        let (key_id, key) = bob_keys.one_time_keys.iter().next().unwrap();
        let claim = crate::requests::KeysClaimResponse {
            one_time_keys: [(
                bob.user_id().to_owned(),
                [(
                    bob.device_id().to_owned(),
                    [(key_id.clone(), key.clone())].into(),
                )]
                .into(),
            )]
            .into(),
            ..Default::default()
        };

        // Bob's account must consider the key published so the prekey
        // message can be handled.
        bob.receive_keys_upload_response(&crate::requests::KeysUploadResponse {
            one_time_key_counts: [(
                "signed_curve25519".to_owned(),
                bob_keys.one_time_keys.len() as u64,
            )]
            .into(),
        })
        .await
        .unwrap();

        let summary = alice.receive_keys_claim_response(&claim).await.unwrap();
        assert_eq!(summary.created.len(), 1);
    }
}
