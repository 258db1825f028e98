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

//! Decryption of secrets held in server-side secret storage
//! (`m.secret_storage.v1.aes-hmac-sha2`).
//!
//! Secret storage is the fallback path of backup recovery: when the key the
//! user supplied doesn't open the backup directly, it may instead open the
//! encrypted `m.megolm_backup.v1` secret stored in their account data.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, KEY_SIZE},
    utilities::{decode_lenient, encode},
};

/// The event type holding the default secret-storage key id.
pub const DEFAULT_KEY_EVENT: &str = "m.secret_storage.default_key";
/// The prefix of the per-key description events.
pub const KEY_DESCRIPTION_PREFIX: &str = "m.secret_storage.key.";
/// The account-data event holding the encrypted backup recovery key.
pub const BACKUP_SECRET_EVENT: &str = "m.megolm_backup.v1";

/// Errors while decrypting a secret-storage payload.
#[derive(Debug, Error)]
pub enum SecretStorageError {
    /// A base64 field of the payload was garbled.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The payload had a field of the wrong size.
    #[error("a field of the encrypted payload has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The MAC check failed; the supplied key doesn't open this secret.
    #[error("the MAC of the encrypted secret didn't match, the key is wrong")]
    Mac(#[from] crate::ciphers::MacError),
}

/// An `m.secret_storage.v1.aes-hmac-sha2` encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// The unpadded base64 AES-CTR ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 initialization vector.
    pub iv: String,
    /// The unpadded base64 HMAC-SHA-256 tag over the ciphertext.
    pub mac: String,
}

/// Decrypt a secret-storage payload with the given key.
///
/// The MAC is verified before anything is decrypted; a failed MAC means the
/// key is wrong, never that partial plaintext should be used.
pub fn decrypt_secret(
    key: &[u8; KEY_SIZE],
    secret_name: &str,
    secret: &EncryptedSecret,
) -> Result<Vec<u8>, SecretStorageError> {
    let ciphertext = decode_lenient(&secret.ciphertext)?;
    let iv = decode_lenient(&secret.iv)?;
    let mac = decode_lenient(&secret.mac)?;

    let iv: [u8; IV_SIZE] =
        iv.as_slice().try_into().map_err(|_| SecretStorageError::Length(IV_SIZE, iv.len()))?;

    let cipher = AesHmacSha2Key::from_secret_storage_key(key, secret_name);
    cipher.verify_mac(&ciphertext, &mac)?;

    Ok(cipher.apply_keystream(ciphertext, &iv))
}

/// Encrypt a secret for secret storage. The inverse of [`decrypt_secret`];
/// used when we bootstrap the backup secret ourselves.
pub fn encrypt_secret(
    key: &[u8; KEY_SIZE],
    secret_name: &str,
    secret: &[u8],
    iv: [u8; IV_SIZE],
) -> EncryptedSecret {
    let cipher = AesHmacSha2Key::from_secret_storage_key(key, secret_name);

    let ciphertext = cipher.apply_keystream(secret.to_vec(), &iv);
    let mac = cipher.mac(&ciphertext);

    EncryptedSecret { ciphertext: encode(&ciphertext), iv: encode(iv), mac: encode(mac) }
}

/// Normalize a decrypted secret into raw key bytes.
///
/// Secrets are usually stored as the base64 encoded form of the key; some
/// clients store the raw bytes directly.
pub fn normalize_secret(decrypted: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if decrypted.len() == KEY_SIZE {
        return Some(Zeroizing::new(decrypted.to_vec()));
    }

    let text = std::str::from_utf8(decrypted).ok()?;
    let decoded = decode_lenient(text.trim()).ok()?;

    (decoded.len() == KEY_SIZE).then(|| Zeroizing::new(decoded))
}

#[cfg(test)]
mod tests {
    use super::{decrypt_secret, encrypt_secret, normalize_secret};

    #[test]
    fn secret_round_trip() {
        let key = [3u8; 32];
        let secret = b"the backup recovery key";

        let encrypted = encrypt_secret(&key, "m.megolm_backup.v1", secret, [9u8; 16]);
        let decrypted = decrypt_secret(&key, "m.megolm_backup.v1", &encrypted).unwrap();

        assert_eq!(decrypted, secret);
    }

    #[test]
    fn wrong_key_fails_the_mac_check() {
        let encrypted = encrypt_secret(&[3u8; 32], "m.megolm_backup.v1", b"secret", [9u8; 16]);

        decrypt_secret(&[4u8; 32], "m.megolm_backup.v1", &encrypted)
            .expect_err("A wrong secret storage key must fail the MAC check");
    }

    #[test]
    fn secrets_normalize_from_base64_and_raw_form() {
        let raw = [5u8; 32];

        assert_eq!(normalize_secret(&raw).unwrap().as_slice(), &raw);

        let encoded = crate::utilities::encode(raw);
        assert_eq!(normalize_secret(encoded.as_bytes()).unwrap().as_slice(), &raw);

        assert!(normalize_secret(b"definitely not a key").is_none());
    }
}
