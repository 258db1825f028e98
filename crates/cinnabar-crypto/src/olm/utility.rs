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

use ruma::UserId;
use serde::Serialize;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::{error::SignatureError, utilities::canonical_json};

/// Sign the canonical JSON form of a serializable value.
pub(crate) trait SignJson {
    /// Serialize the value, strip `signatures`/`unsigned`, canonicalize and
    /// sign the resulting string.
    fn sign_json(&self, value: &impl Serialize) -> Result<Ed25519Signature, SignatureError>;
}

impl SignJson for vodozemac::olm::Account {
    fn sign_json(&self, value: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        let canonical = canonical_json(value)?;
        Ok(self.sign(canonical.as_str()))
    }
}

impl SignJson for vodozemac::Ed25519SecretKey {
    fn sign_json(&self, value: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        let canonical = canonical_json(value)?;
        Ok(self.sign(canonical.as_bytes()))
    }
}

/// Verify a signature that was created over the canonical JSON form of a
/// signed Matrix object.
pub(crate) trait VerifyJson {
    /// Check that the value carries a valid signature from `user_id` under
    /// the given `<algorithm>:<key id>` entry.
    fn verify_canonicalized_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        value: &impl SignedJsonObject,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_canonicalized_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        value: &impl SignedJsonObject,
    ) -> Result<(), SignatureError> {
        let signature = value
            .signature(user_id, key_id)
            .ok_or(SignatureError::NoSignatureFound)?;
        let signature =
            Ed25519Signature::from_base64(&signature).map_err(|_| SignatureError::InvalidSignature)?;

        let canonical = canonical_json(value)?;

        Ok(self.verify(canonical.as_bytes(), &signature)?)
    }
}

/// A serializable object carrying a Matrix `signatures` map.
pub(crate) trait SignedJsonObject: Serialize {
    /// Look up the signature a given user made with a given key.
    fn signature(&self, user_id: &UserId, key_id: &str) -> Option<String>;
}

impl SignedJsonObject for crate::types::DeviceKeys {
    fn signature(&self, user_id: &UserId, key_id: &str) -> Option<String> {
        self.signatures.get(user_id)?.get(key_id).cloned()
    }
}

impl SignedJsonObject for crate::types::SignedKey {
    fn signature(&self, user_id: &UserId, key_id: &str) -> Option<String> {
        self.signatures.get(user_id)?.get(key_id).cloned()
    }
}

impl SignedJsonObject for crate::types::cross_signing::CrossSigningKey {
    fn signature(&self, user_id: &UserId, key_id: &str) -> Option<String> {
        self.signatures.get(user_id)?.get(key_id).cloned()
    }
}
