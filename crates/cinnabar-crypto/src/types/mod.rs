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

//! Wire types for the Matrix key management endpoints.
//!
//! These mirror the JSON bodies of `/keys/upload`, `/keys/query` and
//! `/keys/claim`; they are defined locally so the engine stays independent
//! of any particular HTTP layer.

pub mod cross_signing;
pub mod events;

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{error::SignatureError, olm::VerifyJson};

/// The encryption algorithm a device advertises for 1:1 messages.
pub const OLM_V1_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
/// The encryption algorithm used for room messages.
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
/// The one-time key algorithm we upload and claim.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Signatures over a signed JSON object, keyed by user id and then by
/// `<algorithm>:<key id>`.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<String, String>>;

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTrust {
    /// The device hasn't been verified and hasn't been explicitly rejected.
    Unverified,
    /// The device was verified, either interactively or because it is one of
    /// our own devices and own-device auto-verification is enabled.
    Verified,
    /// The device was explicitly blocked; no room keys are shared with it.
    Blacklisted,
}

impl LocalTrust {
    /// Is the device considered trusted.
    pub fn is_verified(self) -> bool {
        self == LocalTrust::Verified
    }
}

/// The signed, published identity keys of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The user the device belongs to.
    pub user_id: OwnedUserId,
    /// The device id.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// The public identity keys, keyed by `<algorithm>:<device id>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical JSON form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
    /// Additional data the server or client attached, not covered by the
    /// signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<serde_json::Value>,
}

impl DeviceKeys {
    /// Get the Curve25519 identity key of the device, if it has a valid one.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    /// Get the Ed25519 signing key of the device, if it has a valid one.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys
            .get(&format!("ed25519:{}", self.device_id))
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }
}

/// A one-time or fallback key, signed with the device's Ed25519 key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedKey {
    /// The unpadded base64 encoded Curve25519 key.
    pub key: String,
    /// Signatures over the canonical JSON form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
    /// Whether this is a fallback key that can be used more than once.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl SignedKey {
    /// Create a new signed one-time key from a public Curve25519 key.
    ///
    /// The signature still needs to be added by the account.
    pub fn new(key: Curve25519PublicKey) -> Self {
        Self { key: key.to_base64(), signatures: Default::default(), fallback: false }
    }

    /// Create a new signed fallback key from a public Curve25519 key.
    pub fn new_fallback(key: Curve25519PublicKey) -> Self {
        Self { key: key.to_base64(), signatures: Default::default(), fallback: true }
    }

    /// Get the Curve25519 key, if it decodes.
    pub fn curve25519_key(&self) -> Result<Curve25519PublicKey, vodozemac::KeyError> {
        Curve25519PublicKey::from_base64(&self.key)
    }
}

/// Everything we know about a remote device: its published keys plus our
/// local trust decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceData {
    /// The published, signature-checked device keys.
    pub keys: DeviceKeys,
    /// The local trust state of the device.
    pub local_trust: LocalTrust,
}

impl DeviceData {
    /// Wrap freshly queried device keys; the device starts out unverified.
    pub fn new(keys: DeviceKeys) -> Self {
        Self { keys, local_trust: LocalTrust::Unverified }
    }

    /// The user this device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.keys.user_id
    }

    /// The id of the device.
    pub fn device_id(&self) -> &ruma::DeviceId {
        &self.keys.device_id
    }

    /// The Curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys.curve25519_key()
    }

    /// The Ed25519 signing key of the device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.ed25519_key()
    }

    /// Is the device trusted.
    pub fn is_verified(&self) -> bool {
        self.local_trust.is_verified()
    }

    /// Is the device blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::Blacklisted
    }

    /// Check that the device keys are self-signed with the device's own
    /// Ed25519 key.
    ///
    /// Keys that fail this check must never be stored; a homeserver could
    /// otherwise substitute identity keys at will.
    pub fn verify_self_signature(&self) -> Result<(), SignatureError> {
        let key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        key.verify_canonicalized_json(
            self.user_id(),
            &format!("ed25519:{}", self.device_id()),
            &self.keys,
        )
    }

    /// Check the signature of a one-time key this device handed out.
    pub fn verify_one_time_key(&self, key: &SignedKey) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_canonicalized_json(
            self.user_id(),
            &format!("ed25519:{}", self.device_id()),
            key,
        )
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::{DeviceData, DeviceKeys, LocalTrust};
    use crate::Account;

    #[test]
    fn self_signature_of_own_device_keys_verifies() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));
        let device_keys = account.device_keys();

        let device = DeviceData::new(device_keys);

        device
            .verify_self_signature()
            .expect("Our own freshly signed device keys should verify");
        assert!(!device.is_verified());
        assert_eq!(device.local_trust, LocalTrust::Unverified);
    }

    #[test]
    fn tampered_device_keys_fail_the_signature_check() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));
        let mut device_keys: DeviceKeys = account.device_keys();

        device_keys.algorithms.push("m.fancy.new.algorithm".to_owned());

        let device = DeviceData::new(device_keys);
        device
            .verify_self_signature()
            .expect_err("Tampering with the signed fields should break the signature");
    }
}
