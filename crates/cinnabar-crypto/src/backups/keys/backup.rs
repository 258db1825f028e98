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

use std::sync::{Arc, Mutex};

use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::Zeroizing;

use crate::{
    ciphers::BackupCipherKey,
    olm::InboundGroupSession,
    requests::{EncryptedSessionData, KeyBackupData},
    utilities::encode,
};

/// The algorithm name of the backup scheme this key encrypts for.
pub const MEGOLM_BACKUP_V1_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: Mutex<Option<String>>,
}

/// The public part of a backup key.
///
/// Room keys are encrypted against this key before they are uploaded; only
/// the matching [`BackupDecryptionKey`](super::BackupDecryptionKey) can read
/// them back.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: InnerBackupKey { key, version: Mutex::new(version) }.into() }
    }

    /// The full name of the backup algorithm this key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1_ALGORITHM
    }

    /// Try to create a `MegolmV1BackupKey` from a base64 encoded public key.
    pub fn from_base64(public_key: &str) -> Result<Self, vodozemac::KeyError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;

        Ok(Self::new(key, None))
    }

    /// The base64 encoded public key.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// The backup version this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().unwrap().clone()
    }

    /// Set the backup version this key will be used with.
    ///
    /// Room keys can't be uploaded before a version is known.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock().unwrap() = Some(version);
    }

    /// Encrypt a single inbound group session for upload.
    ///
    /// A fresh ephemeral Curve25519 keypair per entry: ECDH against the
    /// backup public key, HKDF into AES-CTR key material, an 8-byte
    /// truncated HMAC-SHA-256 tag over the ciphertext.
    pub async fn encrypt(&self, session: &InboundGroupSession) -> KeyBackupData {
        let export = session.export().await;

        let first_message_index = session.first_known_index();
        let forwarded_count = session.forwarding_key_chain.len() as u32;

        let plaintext = Zeroizing::new(
            serde_json::to_vec(&export).expect("We can always serialize a session export"),
        );

        let ephemeral_secret = Curve25519SecretKey::new();
        let ephemeral_public = Curve25519PublicKey::from(&ephemeral_secret);

        let shared_secret = ephemeral_secret.diffie_hellman(&self.inner.key);
        let cipher = BackupCipherKey::from_shared_secret(shared_secret.as_bytes());

        let (ciphertext, mac) = cipher.encrypt(plaintext.to_vec());

        KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: ephemeral_public.to_base64(),
                ciphertext: encode(ciphertext),
                mac: encode(mac),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::MegolmV1BackupKey;
    use crate::{
        backups::BackupDecryptionKey,
        olm::{EncryptionSettings, InboundGroupSession, OutboundGroupSession},
    };

    #[tokio::test]
    async fn backed_up_session_decrypts_with_the_matching_key() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let outbound = OutboundGroupSession::new(
            room_id!("!room:localhost"),
            EncryptionSettings::default(),
        );
        let inbound = InboundGroupSession::from_room_key(
            "SENDERKEY",
            None,
            &outbound.as_room_key_content().await,
        )
        .unwrap();

        let backup_data = backup_key.encrypt(&inbound).await;

        let export = decryption_key
            .decrypt_session_data(&backup_data.session_data)
            .expect("The backed up key should decrypt successfully");

        assert_eq!(export.session_id, inbound.session_id());
        assert_eq!(export.room_id, room_id!("!room:localhost"));
    }

    #[tokio::test]
    async fn wrong_key_cannot_decrypt_the_backup() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let outbound = OutboundGroupSession::new(
            room_id!("!room:localhost"),
            EncryptionSettings::default(),
        );
        let inbound = InboundGroupSession::from_room_key(
            "SENDERKEY",
            None,
            &outbound.as_room_key_content().await,
        )
        .unwrap();

        let backup_data = backup_key.encrypt(&inbound).await;

        let wrong_key = BackupDecryptionKey::new();
        wrong_key
            .decrypt_session_data(&backup_data.session_data)
            .expect_err("A different recovery key must not decrypt the entry");
    }

    #[test]
    fn public_key_round_trips_through_base64() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let restored = MegolmV1BackupKey::from_base64(&backup_key.to_base64()).unwrap();
        assert_eq!(restored.to_base64(), backup_key.to_base64());
        assert!(restored.backup_version().is_none());
    }
}
