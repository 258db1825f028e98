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

//! The private part of the cross-signing key hierarchy.
//!
//! The master key signs the self-signing and user-signing keys; the
//! self-signing key signs our own devices, the user-signing key signs other
//! users' master keys.

use std::fmt;

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519SecretKey;
use zeroize::Zeroizing;

use super::SignJson;
use crate::{
    error::SignatureError,
    requests::SigningKeysUploadRequest,
    types::{
        cross_signing::{CrossSigningKey, KeyUsage},
        DeviceKeys,
    },
};

/// A single private cross-signing key together with its role.
struct Signing {
    inner: Ed25519SecretKey,
    usage: KeyUsage,
}

impl Signing {
    fn new(usage: KeyUsage) -> Self {
        Self { inner: Ed25519SecretKey::new(), usage }
    }

    fn from_base64(usage: KeyUsage, key: &str) -> Result<Self, vodozemac::KeyError> {
        Ok(Self { inner: Ed25519SecretKey::from_base64(key)?, usage })
    }

    fn public_key(&self, user_id: &UserId) -> CrossSigningKey {
        CrossSigningKey::new(user_id.to_owned(), self.usage, self.inner.public_key())
    }

    fn key_id(&self) -> String {
        format!("ed25519:{}", self.inner.public_key().to_base64())
    }

    fn sign_subkey(
        &self,
        user_id: &UserId,
        subkey: &mut CrossSigningKey,
    ) -> Result<(), SignatureError> {
        let signature = self.inner.sign_json(subkey)?;

        subkey
            .signatures
            .entry(user_id.to_owned())
            .or_default()
            .insert(self.key_id(), signature.to_base64());

        Ok(())
    }
}

/// The complete private cross-signing identity of our own user.
pub struct PrivateCrossSigningIdentity {
    user_id: OwnedUserId,
    master: Signing,
    self_signing: Signing,
    user_signing: Signing,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl PrivateCrossSigningIdentity {
    /// Generate a fresh cross-signing hierarchy for the given user.
    pub fn new(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            master: Signing::new(KeyUsage::Master),
            self_signing: Signing::new(KeyUsage::SelfSigning),
            user_signing: Signing::new(KeyUsage::UserSigning),
        }
    }

    /// The user this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The base64 encoded public part of the master key.
    pub fn master_public_key(&self) -> String {
        self.master.inner.public_key().to_base64()
    }

    /// Build the upload request carrying the public keys, with the master
    /// key's signatures over the two subkeys.
    pub fn as_upload_request(&self) -> Result<SigningKeysUploadRequest, SignatureError> {
        let master_key = self.master.public_key(&self.user_id);

        let mut self_signing_key = self.self_signing.public_key(&self.user_id);
        self.master.sign_subkey(&self.user_id, &mut self_signing_key)?;

        let mut user_signing_key = self.user_signing.public_key(&self.user_id);
        self.master.sign_subkey(&self.user_id, &mut user_signing_key)?;

        Ok(SigningKeysUploadRequest { master_key, self_signing_key, user_signing_key })
    }

    /// Sign one of our own devices with the self-signing key.
    ///
    /// The signature is added to the `signatures` map of the device keys, as
    /// expected by `/keys/signatures/upload`.
    pub fn sign_device(&self, device_keys: &mut DeviceKeys) -> Result<(), SignatureError> {
        let signature = self.self_signing.inner.sign_json(device_keys)?;

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.self_signing.key_id(), signature.to_base64());

        Ok(())
    }

    /// Sign another user's master key with the user-signing key.
    pub fn sign_user(&self, master_key: &mut CrossSigningKey) -> Result<(), SignatureError> {
        let signature = self.user_signing.inner.sign_json(master_key)?;

        master_key
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.user_signing.key_id(), signature.to_base64());

        Ok(())
    }

    /// Pickle the private keys for storage.
    pub fn pickle(&self) -> PickledCrossSigningIdentity {
        PickledCrossSigningIdentity {
            user_id: self.user_id.clone(),
            master_key: self.master.inner.to_base64().to_string(),
            self_signing_key: self.self_signing.inner.to_base64().to_string(),
            user_signing_key: self.user_signing.inner.to_base64().to_string(),
        }
    }

    /// Restore the identity from its pickled form.
    pub fn from_pickle(
        pickle: &PickledCrossSigningIdentity,
    ) -> Result<Self, vodozemac::KeyError> {
        Ok(Self {
            user_id: pickle.user_id.clone(),
            master: Signing::from_base64(KeyUsage::Master, &pickle.master_key)?,
            self_signing: Signing::from_base64(KeyUsage::SelfSigning, &pickle.self_signing_key)?,
            user_signing: Signing::from_base64(KeyUsage::UserSigning, &pickle.user_signing_key)?,
        })
    }
}

/// The pickled private cross-signing keys.
///
/// Holds raw key material; wrap in [`Zeroizing`] when handling intermediate
/// copies.
#[derive(Clone, Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledCrossSigningIdentity {
    /// The user the identity belongs to.
    pub user_id: OwnedUserId,
    /// The base64 encoded private master key.
    pub master_key: String,
    /// The base64 encoded private self-signing key.
    pub self_signing_key: String,
    /// The base64 encoded private user-signing key.
    pub user_signing_key: String,
}

impl Drop for PickledCrossSigningIdentity {
    fn drop(&mut self) {
        let _ = Zeroizing::new(std::mem::take(&mut self.master_key));
        let _ = Zeroizing::new(std::mem::take(&mut self.self_signing_key));
        let _ = Zeroizing::new(std::mem::take(&mut self.user_signing_key));
    }
}

#[cfg(test)]
mod tests {
    use ruma::user_id;

    use super::PrivateCrossSigningIdentity;
    use crate::{
        olm::VerifyJson,
        types::cross_signing::KeyUsage,
        Account,
    };

    #[test]
    fn upload_request_has_master_signed_subkeys() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let request = identity.as_upload_request().unwrap();

        assert_eq!(request.master_key.usage, vec![KeyUsage::Master]);

        let master_key = request.master_key.get_first_key().unwrap();
        let master_key_id = format!("ed25519:{}", master_key.to_base64());

        master_key
            .verify_canonicalized_json(
                user_id!("@alice:localhost"),
                &master_key_id,
                &request.self_signing_key,
            )
            .expect("The self-signing key should carry a valid master-key signature");
        master_key
            .verify_canonicalized_json(
                user_id!("@alice:localhost"),
                &master_key_id,
                &request.user_signing_key,
            )
            .expect("The user-signing key should carry a valid master-key signature");
    }

    #[test]
    fn device_signature_verifies_and_pickle_round_trips() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let account =
            Account::new(user_id!("@alice:localhost"), ruma::device_id!("ALICEDEV"));

        let mut device_keys = account.device_keys();
        identity.sign_device(&mut device_keys).unwrap();

        let restored =
            PrivateCrossSigningIdentity::from_pickle(&identity.pickle()).unwrap();
        let self_signing_key = restored.as_upload_request().unwrap().self_signing_key;
        let public = self_signing_key.get_first_key().unwrap();

        public
            .verify_canonicalized_json(
                user_id!("@alice:localhost"),
                &format!("ed25519:{}", public.to_base64()),
                &device_keys,
            )
            .expect("The device signature from the self-signing key should verify");
    }
}
