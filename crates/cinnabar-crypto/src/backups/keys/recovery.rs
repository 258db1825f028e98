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

use std::fmt;

use rand::{thread_rng, RngCore};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    ciphers::{AesHmacSha2Key, BackupCipherKey, MacError},
    olm::ExportedRoomKey,
    requests::EncryptedSessionData,
    utilities::decode_lenient,
};

/// Errors when decoding a user-supplied recovery key.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the key doesn't match.
    #[error("the parity byte of the recovery key doesn't match: expected {0}, got {1}")]
    Parity(u8, u8),
    /// The key has an unexpected length.
    #[error("the decoded recovery key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The key wasn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The key wasn't valid base64 either.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

/// Errors when decrypting a backed-up room key.
#[derive(Debug, Error)]
pub enum BackupDecryptionError {
    /// One of the base64 fields of the entry was garbled.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    /// The ephemeral key of the entry wasn't a valid Curve25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),
    /// The authentication tag of the entry didn't match.
    #[error(transparent)]
    Mac(#[from] MacError),
    /// The decrypted entry wasn't a valid session export.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private recovery key that can decrypt a server-side room key backup.
///
/// 32 random bytes. Displayed to the user as checksum-protected Base58 in
/// the `Es…` form; also accepted as raw unpadded base64.
#[derive(Clone, Zeroize)]
pub struct BackupDecryptionKey {
    key: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupDecryptionKey").field("key", &"*****").finish()
    }
}

impl fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base58 = Zeroizing::new(self.to_base58());

        let chunks = base58
            .as_bytes()
            .chunks(Self::DISPLAY_CHUNK_SIZE)
            .map(|c| std::str::from_utf8(c).expect("Base58 strings are always ASCII"))
            .collect::<Vec<_>>();

        write!(f, "{}", chunks.join(" "))
    }
}

impl BackupDecryptionKey {
    const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX[0] ^ Self::PREFIX[1], |acc, x| acc ^ x)
    }

    /// Generate a new random recovery key.
    pub fn new() -> Self {
        let mut rng = thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rng.fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Create a recovery key from raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { key: Box::new(*key) }
    }

    /// Derive a recovery key from a passphrase.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let key = AesHmacSha2Key::expand_passphrase(passphrase, salt, rounds);

        Self { key }
    }

    /// Try to parse a user-supplied key string, accepting the Base58 display
    /// form and the raw base64 fallback.
    pub fn from_str_lossy(input: &str) -> Result<Self, DecodeError> {
        Self::from_base58(input).or_else(|e| Self::from_base64(input).map_err(|_| e))
    }

    /// Parse the checksum-protected Base58 form.
    ///
    /// Whitespace and dashes from the grouped display form are ignored.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: String =
            value.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();

        let decoded = Zeroizing::new(
            bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_len = Self::KEY_SIZE + Self::PREFIX.len() + 1;
        if decoded.len() != expected_len {
            return Err(DecodeError::Length(expected_len, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        if prefix != Self::PREFIX {
            return Err(DecodeError::Prefix(Self::PREFIX, prefix));
        }

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        key.copy_from_slice(&decoded[2..2 + Self::KEY_SIZE]);

        let expected_parity = decoded[decoded.len() - 1];
        let parity = Self::parity_byte(key.as_slice());

        if expected_parity != parity {
            return Err(DecodeError::Parity(expected_parity, parity));
        }

        Ok(Self { key })
    }

    /// Parse the unpadded base64 fallback form.
    pub fn from_base64(value: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(decode_lenient(value)?);

        if decoded.len() != Self::KEY_SIZE {
            return Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()));
        }

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        key.copy_from_slice(&decoded);

        Ok(Self { key })
    }

    /// Encode the key in the checksum-protected Base58 form.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_slice(),
                self.key.as_slice(),
                &[Self::parity_byte(self.key.as_slice())],
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// Encode the key as unpadded base64.
    pub fn to_base64(&self) -> String {
        crate::utilities::encode(self.key.as_slice())
    }

    /// The raw key bytes.
    ///
    /// Needed when the user-supplied key turns out to be a secret-storage
    /// key rather than the backup key itself.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// The public half of this key, against which room keys get encrypted
    /// for backup.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        let secret_key = Curve25519SecretKey::from_slice(&self.key);
        let public_key = Curve25519PublicKey::from(&secret_key);

        MegolmV1BackupKey::new(public_key, None)
    }

    /// Decrypt a single backed-up session entry.
    ///
    /// ECDH with the entry's ephemeral key, HKDF into AES/MAC/IV, then MAC
    /// check before AES-CTR decryption.
    pub fn decrypt_session_data(
        &self,
        data: &EncryptedSessionData,
    ) -> Result<ExportedRoomKey, BackupDecryptionError> {
        let ephemeral_key = Curve25519PublicKey::from_base64(&data.ephemeral)?;
        let ciphertext = decode_lenient(&data.ciphertext)?;
        let mac = decode_lenient(&data.mac)?;

        let secret_key = Curve25519SecretKey::from_slice(&self.key);
        let shared_secret = secret_key.diffie_hellman(&ephemeral_key);

        let cipher = BackupCipherKey::from_shared_secret(shared_secret.as_bytes());
        let plaintext = Zeroizing::new(cipher.decrypt(ciphertext, &mac)?);

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::BackupDecryptionKey;

    #[test]
    fn base58_round_trip_with_display_grouping() {
        let key = BackupDecryptionKey::new();

        let displayed = key.to_string();
        assert!(displayed.contains(' '));

        let parsed = BackupDecryptionKey::from_base58(&displayed)
            .expect("The grouped display form should parse");
        assert_eq!(parsed.to_base64(), key.to_base64());
    }

    #[test]
    fn known_recovery_key_decodes() {
        // A recovery key in the form other Matrix clients hand out.
        let key = BackupDecryptionKey::from_bytes(&[0u8; 32]);
        let encoded = key.to_base58();

        assert!(encoded.starts_with("Es"));

        let decoded = BackupDecryptionKey::from_str_lossy(&encoded).unwrap();
        assert_eq!(decoded.to_base64(), key.to_base64());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let key = BackupDecryptionKey::new();
        let mut encoded = key.to_base58();

        // Flip the final checksum character to something else.
        let last = encoded.pop().unwrap();
        encoded.push(if last == '1' { '2' } else { '1' });

        BackupDecryptionKey::from_base58(&encoded)
            .expect_err("A corrupted recovery key must not decode");
    }

    #[test]
    fn base64_fallback_parses() {
        let key = BackupDecryptionKey::new();
        let parsed = BackupDecryptionKey::from_str_lossy(&key.to_base64()).unwrap();

        assert_eq!(parsed.to_base64(), key.to_base64());
    }
}
