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

//! Requests the engine asks the transport layer to send, and the responses
//! it consumes.
//!
//! The engine itself never talks HTTP; it hands these values to whatever
//! drives it and receives the parsed response bodies back.

use std::collections::{BTreeMap, HashMap};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    olm::OneTimeKeys,
    types::{cross_signing::CrossSigningKey, DeviceKeys, SignedKey},
};

/// A request that should be sent out, tagged with a unique id used to route
/// the response back to the engine.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// A unique id identifying this request.
    pub request_id: OwnedTransactionId,
    /// The request itself.
    pub request: AnyOutgoingRequest,
}

/// The different requests the engine can produce.
#[derive(Debug, Clone)]
pub enum AnyOutgoingRequest {
    /// Upload our device keys and one-time keys.
    KeysUpload(KeysUploadRequest),
    /// Query device keys of other users.
    KeysQuery(KeysQueryRequest),
    /// Claim one-time keys to establish Olm sessions.
    KeysClaim(KeysClaimRequest),
    /// Send to-device events.
    ToDevice(ToDeviceRequest),
}

/// The body of a `POST /keys/upload` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed device keys, if they haven't been uploaded yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys, keyed by `signed_curve25519:<key id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: OneTimeKeys,
}

/// The response to a `/keys/upload` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many one-time keys the server now holds for us, per algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// The body of a `POST /keys/query` request.
///
/// An empty device list requests all devices of the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users and devices to query.
    pub device_keys: HashMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

/// The response to a `/keys/query` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The queried device keys.
    #[serde(default)]
    pub device_keys: HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceKeys>>,
    /// The master cross-signing keys of the queried users.
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The self-signing cross-signing keys of the queried users.
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The user-signing cross-signing keys of the queried users.
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// Users the server failed to reach.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The body of a `POST /keys/claim` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The one-time key algorithm to claim, per user and device.
    pub one_time_keys: HashMap<OwnedUserId, HashMap<OwnedDeviceId, String>>,
}

/// The response to a `/keys/claim` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, keyed by user, device and
    /// `signed_curve25519:<key id>`.
    #[serde(default)]
    pub one_time_keys:
        HashMap<OwnedUserId, HashMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
    /// Servers that could not be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// A `PUT /sendToDevice/{eventType}/{txnId}` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the event to send.
    pub event_type: String,
    /// The transaction id for this request.
    pub txn_id: OwnedTransactionId,
    /// The per-device message contents.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request carrying a single message.
    pub fn new(
        recipient: OwnedUserId,
        recipient_device: OwnedDeviceId,
        event_type: &str,
        content: Value,
    ) -> Self {
        let messages =
            BTreeMap::from([(recipient, BTreeMap::from([(recipient_device, content)]))]);

        Self {
            event_type: event_type.to_owned(),
            txn_id: ruma::TransactionId::new(),
            messages,
        }
    }
}

/// The body of a `POST /keys/device_signing/upload` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeysUploadRequest {
    /// The public master key.
    pub master_key: CrossSigningKey,
    /// The public self-signing key, signed by the master key.
    pub self_signing_key: CrossSigningKey,
    /// The public user-signing key, signed by the master key.
    pub user_signing_key: CrossSigningKey,
}

/// A backup version as returned by `GET /room_keys/version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The backup algorithm.
    pub algorithm: String,
    /// Algorithm-dependent auth data; for `m.megolm_backup.v1` this holds
    /// the public key the backup is encrypted against.
    pub auth_data: BackupAuthData,
    /// The version string identifying this backup.
    pub version: String,
    /// How many keys the backup holds.
    #[serde(default)]
    pub count: u64,
    /// An opaque string that changes every time the backup contents change.
    #[serde(default)]
    pub etag: String,
}

/// The auth data of a `m.megolm_backup.v1.curve25519-aes-sha2` backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupAuthData {
    /// The unpadded base64 public Curve25519 key of the backup.
    pub public_key: String,
    /// Signatures over the auth data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: crate::types::Signatures,
}

/// The body of a `PUT /room_keys/keys` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The encrypted room keys, grouped by room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// The backed up keys of a single room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The backed up sessions, keyed by session id.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// A single backed up room key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The earliest message index the key can decrypt.
    pub first_message_index: u32,
    /// How often the key was forwarded before we got it.
    pub forwarded_count: u32,
    /// Whether the device the key came from was verified.
    pub is_verified: bool,
    /// The encrypted session export.
    pub session_data: EncryptedSessionData,
}

/// The ciphertext part of a backed up room key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 ephemeral Curve25519 key of this entry.
    pub ephemeral: String,
    /// The unpadded base64 AES-CTR ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 truncated HMAC-SHA-256 tag over the ciphertext.
    pub mac: String,
}
