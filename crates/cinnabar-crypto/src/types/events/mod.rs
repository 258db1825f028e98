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

//! The to-device and room event payloads the engine sends and receives.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage};

use super::{MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM};

/// A to-device event as it appears in the `to_device` section of a sync
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: C,
}

/// The content of an `m.room.encrypted` to-device event, carrying an
/// Olm-encrypted payload for one or more devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    /// The encryption algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: String,
    /// The Curve25519 identity key of the sending device.
    pub sender_key: String,
    /// Per-recipient ciphertexts, keyed by the recipient's Curve25519 key.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

/// The content of an `m.room.encrypted` room event, encrypted with Megolm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    /// The encryption algorithm, always `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// The encrypted payload.
    pub ciphertext: MegolmMessage,
    /// The id of the Megolm session that was used to encrypt the payload.
    pub session_id: String,
    /// The Curve25519 key of the sending device.
    ///
    /// Historical field, not trusted for anything; the session id is the
    /// authoritative lookup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    /// The id of the sending device. Historical field as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
}

/// The plaintext payload that gets Olm-encrypted into a to-device message.
///
/// The sender/recipient/keys fields bind the plaintext to the devices on
/// both ends; they are checked after decryption to detect unknown-key-share
/// attacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlmPayload {
    /// The user that encrypted the payload.
    pub sender: OwnedUserId,
    /// The device that encrypted the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,
    /// The long-term signing keys of the sender.
    pub keys: BTreeMap<String, String>,
    /// The intended recipient.
    pub recipient: OwnedUserId,
    /// The long-term signing keys of the intended recipient.
    pub recipient_keys: BTreeMap<String, String>,
    /// The type of the embedded event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the embedded event.
    pub content: Value,
}

/// The plaintext payload of a Megolm-encrypted room event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MegolmPayload {
    /// The type of the embedded event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the embedded event.
    pub content: Value,
    /// The room the payload was encrypted for.
    pub room_id: OwnedRoomId,
}

/// The content of an `m.room_key` to-device event, delivered Olm-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm of the session key, always `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
}

impl RoomKeyContent {
    pub(crate) fn new(room_id: OwnedRoomId, session_id: String, session_key: String) -> Self {
        Self { algorithm: MEGOLM_V1_ALGORITHM.to_owned(), room_id, session_id, session_key }
    }
}

/// The content of an `m.forwarded_room_key` to-device event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the session key.
    pub algorithm: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The exported session key, importable from any ratchet index.
    pub session_key: String,
    /// The Curve25519 key of the device that originally created the session.
    pub sender_key: String,
    /// The Ed25519 key the original sender claimed to have.
    #[serde(
        default,
        rename = "sender_claimed_ed25519_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_claimed_ed25519_key: Option<String>,
    /// The chain of devices the key was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The action of an `m.room_key_request` to-device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// A new request for a room key.
    Request,
    /// A previously sent request is no longer needed.
    RequestCancellation,
}

/// Identifies the room key an `m.room_key_request` asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The algorithm of the requested session.
    pub algorithm: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the requested session.
    pub session_id: String,
    /// The Curve25519 key of the device the session came from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
}

/// The content of an `m.room_key_request` to-device event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a request or a cancellation.
    pub action: KeyRequestAction,
    /// What is being requested; absent for cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    /// The device sending the request.
    pub requesting_device_id: OwnedDeviceId,
    /// An id identifying the request, used to match cancellations.
    pub request_id: String,
}

impl OlmEncryptedContent {
    pub(crate) fn new(
        sender_key: String,
        recipient_key: String,
        ciphertext: OlmMessage,
    ) -> Self {
        Self {
            algorithm: OLM_V1_ALGORITHM.to_owned(),
            sender_key,
            ciphertext: BTreeMap::from([(recipient_key, ciphertext)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{KeyRequestAction, RoomKeyContent, RoomKeyRequestContent, ToDeviceEvent};

    #[test]
    fn room_key_event_deserializes() {
        let event = json!({
            "sender": "@alice:example.org",
            "type": "m.room_key",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!room:example.org",
                "session_id": "session17",
                "session_key": "AgAAAA",
            }
        });

        let event: ToDeviceEvent<RoomKeyContent> = serde_json::from_value(event).unwrap();

        assert_eq!(event.content.session_id, "session17");
        assert_eq!(event.content.room_id, "!room:example.org");
    }

    #[test]
    fn key_request_action_round_trips() {
        let content = json!({
            "action": "request_cancellation",
            "requesting_device_id": "OTHERDEV",
            "request_id": "req1",
        });

        let content: RoomKeyRequestContent = serde_json::from_value(content).unwrap();

        assert_eq!(content.action, KeyRequestAction::RequestCancellation);
        assert!(content.body.is_none());
    }
}
