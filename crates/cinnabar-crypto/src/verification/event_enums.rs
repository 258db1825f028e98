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

//! The verification protocol events as a tagged union.
//!
//! Inbound to-device events get parsed into [`AnyVerificationEvent`] and
//! dispatched through a single transition function, instead of a table of
//! per-type callbacks.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The event type of each step in the verification flow.
pub const REQUEST_EVENT: &str = "m.key.verification.request";
pub const READY_EVENT: &str = "m.key.verification.ready";
pub const START_EVENT: &str = "m.key.verification.start";
pub const ACCEPT_EVENT: &str = "m.key.verification.accept";
pub const KEY_EVENT: &str = "m.key.verification.key";
pub const MAC_EVENT: &str = "m.key.verification.mac";
pub const DONE_EVENT: &str = "m.key.verification.done";
pub const CANCEL_EVENT: &str = "m.key.verification.cancel";

/// The SAS verification method string.
pub const SAS_V1_METHOD: &str = "m.sas.v1";

/// A code describing why a verification flow was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCode {
    /// The user cancelled the verification.
    #[serde(rename = "m.user")]
    User,
    /// The flow timed out.
    #[serde(rename = "m.timeout")]
    Timeout,
    /// An event referenced an unknown transaction.
    #[serde(rename = "m.unknown_transaction")]
    UnknownTransaction,
    /// None of the proposed methods are supported.
    #[serde(rename = "m.unknown_method")]
    UnknownMethod,
    /// An event arrived that doesn't fit the current state.
    #[serde(rename = "m.unexpected_message")]
    UnexpectedMessage,
    /// A key or MAC didn't match what was expected.
    #[serde(rename = "m.key_mismatch")]
    KeyMismatch,
    /// The users didn't match what the flow expected.
    #[serde(rename = "m.user_mismatch")]
    UserMismatch,
    /// A message was malformed.
    #[serde(rename = "m.invalid_message")]
    InvalidMessage,
    /// The flow was accepted on another device.
    #[serde(rename = "m.accepted")]
    Accepted,
    /// The hash commitment didn't match the revealed key.
    #[serde(rename = "m.mismatched_commitment")]
    MismatchedCommitment,
    /// The short authentication string didn't match.
    #[serde(rename = "m.mismatched_sas")]
    MismatchedSas,
    /// A cancel code this implementation doesn't know.
    #[serde(untagged)]
    Other(String),
}

impl CancelCode {
    /// A human readable reason for the cancellation.
    pub fn as_reason(&self) -> &str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction."
            }
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::KeyMismatch => "The key was not verified.",
            CancelCode::UserMismatch => "The expected user did not match the user verified.",
            CancelCode::InvalidMessage => "The device received an invalid message.",
            CancelCode::Accepted => "The verification was accepted on another device.",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication string did not match.",
            CancelCode::Other(_) => "The verification was cancelled.",
        }
    }
}

/// The content of an `m.key.verification.request` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContent {
    /// The device requesting verification.
    pub from_device: OwnedDeviceId,
    /// The verification methods the requesting device supports.
    pub methods: Vec<String>,
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// When the request was made, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// The content of an `m.key.verification.ready` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyContent {
    /// The device accepting the request.
    pub from_device: OwnedDeviceId,
    /// The methods the accepting device supports.
    pub methods: Vec<String>,
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
}

/// The content of an `m.key.verification.start` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartContent {
    /// The device starting the verification.
    pub from_device: OwnedDeviceId,
    /// The verification method, `m.sas.v1` for SAS.
    pub method: String,
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The key agreement protocols the device supports.
    #[serde(default)]
    pub key_agreement_protocols: Vec<String>,
    /// The hash algorithms the device supports.
    #[serde(default)]
    pub hashes: Vec<String>,
    /// The MAC methods the device supports.
    #[serde(default)]
    pub message_authentication_codes: Vec<String>,
    /// The SAS display methods the device supports.
    #[serde(default)]
    pub short_authentication_string: Vec<String>,
}

/// The content of an `m.key.verification.accept` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The verification method.
    pub method: String,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash algorithm.
    pub hash: String,
    /// The chosen MAC method.
    pub message_authentication_code: String,
    /// The SAS display methods both sides support.
    pub short_authentication_string: Vec<String>,
    /// The accepting side's hash commitment over its ephemeral public key
    /// and the start event.
    pub commitment: String,
}

/// The content of an `m.key.verification.key` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The unpadded base64 ephemeral Curve25519 public key.
    pub key: String,
}

/// The content of an `m.key.verification.mac` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// MACs over the claimed device keys, keyed by
    /// `<algorithm>:<key id>`.
    pub mac: BTreeMap<String, String>,
    /// A MAC over the comma-separated, sorted list of key ids in `mac`.
    pub keys: String,
}

/// The content of an `m.key.verification.done` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
}

/// The content of an `m.key.verification.cancel` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The machine readable cancellation code.
    pub code: CancelCode,
    /// A human readable reason.
    pub reason: String,
}

/// Any verification event, parsed from its to-device form.
#[derive(Debug, Clone)]
pub enum AnyVerificationEvent {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl AnyVerificationEvent {
    /// Parse a to-device event into a verification event, if the type is a
    /// verification type.
    ///
    /// Returns `None` for non-verification types; malformed contents of a
    /// known type surface as an error.
    pub fn from_to_device(
        event_type: &str,
        content: &Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        let content = content.clone();

        Some(match event_type {
            REQUEST_EVENT => serde_json::from_value(content).map(Self::Request),
            READY_EVENT => serde_json::from_value(content).map(Self::Ready),
            START_EVENT => serde_json::from_value(content).map(Self::Start),
            ACCEPT_EVENT => serde_json::from_value(content).map(Self::Accept),
            KEY_EVENT => serde_json::from_value(content).map(Self::Key),
            MAC_EVENT => serde_json::from_value(content).map(Self::Mac),
            DONE_EVENT => serde_json::from_value(content).map(Self::Done),
            CANCEL_EVENT => serde_json::from_value(content).map(Self::Cancel),
            _ => return None,
        })
    }

    /// The transaction id the event belongs to.
    pub fn transaction_id(&self) -> &ruma::TransactionId {
        match self {
            Self::Request(c) => &c.transaction_id,
            Self::Ready(c) => &c.transaction_id,
            Self::Start(c) => &c.transaction_id,
            Self::Accept(c) => &c.transaction_id,
            Self::Key(c) => &c.transaction_id,
            Self::Mac(c) => &c.transaction_id,
            Self::Done(c) => &c.transaction_id,
            Self::Cancel(c) => &c.transaction_id,
        }
    }

    /// The to-device event type of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => REQUEST_EVENT,
            Self::Ready(_) => READY_EVENT,
            Self::Start(_) => START_EVENT,
            Self::Accept(_) => ACCEPT_EVENT,
            Self::Key(_) => KEY_EVENT,
            Self::Mac(_) => MAC_EVENT,
            Self::Done(_) => DONE_EVENT,
            Self::Cancel(_) => CANCEL_EVENT,
        }
    }
}

/// A verification event we want to send out to a specific device.
#[derive(Debug, Clone)]
pub struct OutgoingVerificationRequest {
    /// The recipient.
    pub to_user_id: OwnedUserId,
    /// The recipient's device.
    pub to_device_id: OwnedDeviceId,
    /// The to-device event type.
    pub event_type: String,
    /// The event content.
    pub content: Value,
}

impl OutgoingVerificationRequest {
    pub(crate) fn new(
        to_user_id: OwnedUserId,
        to_device_id: OwnedDeviceId,
        event_type: &str,
        content: impl Serialize,
    ) -> Self {
        Self {
            to_user_id,
            to_device_id,
            event_type: event_type.to_owned(),
            content: serde_json::to_value(content)
                .expect("Verification contents can always be serialized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AnyVerificationEvent, CancelCode};

    #[test]
    fn cancel_codes_round_trip() {
        let code: CancelCode = serde_json::from_value(json!("m.mismatched_sas")).unwrap();
        assert_eq!(code, CancelCode::MismatchedSas);

        let custom: CancelCode = serde_json::from_value(json!("org.example.custom")).unwrap();
        assert_eq!(custom, CancelCode::Other("org.example.custom".to_owned()));

        assert_eq!(serde_json::to_value(&CancelCode::User).unwrap(), json!("m.user"));
    }

    #[test]
    fn non_verification_types_are_ignored() {
        assert!(AnyVerificationEvent::from_to_device("m.room_key", &json!({})).is_none());

        let event = AnyVerificationEvent::from_to_device(
            "m.key.verification.cancel",
            &json!({"transaction_id": "t", "code": "m.user", "reason": "nope"}),
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.transaction_id().as_str(), "t");
    }
}
