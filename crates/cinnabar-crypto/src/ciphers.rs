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

//! The symmetric primitives used by key backup and secret storage:
//! AES-256-CTR with an HMAC-SHA-256 tag, keys derived through HKDF-SHA-256.

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use pbkdf2::pbkdf2;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const MAC_SIZE: usize = 32;
/// Backed up room keys carry only the first 8 bytes of the HMAC tag.
pub(crate) const TRUNCATED_MAC_SIZE: usize = 8;

/// The HKDF info string of the `m.megolm_backup.v1` key derivation.
const MEGOLM_BACKUP_INFO: &[u8] = b"m.megolm_backup.v1";

type Aes256Ctr = Ctr128BE<Aes256>;
type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;

/// The MAC tag failed to verify.
#[derive(Debug, Error)]
#[error("the authentication tag of the ciphertext didn't match")]
pub struct MacError;

/// Keys for the AES-256-CTR + HMAC-SHA-256 scheme of
/// `m.secret_storage.v1.aes-hmac-sha2`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    /// Derive the AES and MAC keys from a secret-storage key.
    ///
    /// Per the spec: HKDF-SHA-256 with a 32-byte zero salt and the secret
    /// name as the info string, expanded to 64 bytes.
    pub(crate) fn from_secret_storage_key(key: &[u8; KEY_SIZE], secret_name: &str) -> Self {
        let mut expanded_keys = [0u8; KEY_SIZE * 2];

        let salt = [0u8; KEY_SIZE];
        let hkdf: Hkdf<Sha256> = Hkdf::new(Some(&salt), key);
        hkdf.expand(secret_name.as_bytes(), &mut expanded_keys)
            .expect("We should be able to expand a 64 byte key from HKDF-SHA-256");

        let key = Self::split_keys(&expanded_keys);
        expanded_keys.zeroize();

        key
    }

    /// Expand a passphrase into a secret-storage key using
    /// PBKDF2-HMAC-SHA-512.
    pub(crate) fn expand_passphrase(
        passphrase: &str,
        salt: &str,
        pbkdf_rounds: u32,
    ) -> Box<[u8; KEY_SIZE]> {
        let mut key = Box::new([0u8; KEY_SIZE]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), pbkdf_rounds, &mut *key)
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        key
    }

    /// Encrypt the plaintext with AES-256-CTR under the given IV.
    ///
    /// Authenticity comes separately from [`AesHmacSha2Key::mac`]; the tag
    /// must be created over the ciphertext and shipped with it.
    pub(crate) fn apply_keystream(&self, mut data: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let mut cipher = Aes256Ctr::new(self.aes_key(), Aes256Iv::from_slice(iv));
        cipher.apply_keystream(&mut data);

        data
    }

    /// Create the HMAC-SHA-256 tag over the ciphertext.
    pub(crate) fn mac(&self, ciphertext: &[u8]) -> [u8; MAC_SIZE] {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create an HMAC object from our 32 byte MAC key");
        hmac.update(ciphertext);

        hmac.finalize().into_bytes().into()
    }

    /// Verify the HMAC-SHA-256 tag over the ciphertext in constant time.
    ///
    /// Accepts full 32-byte tags as well as the 8-byte truncated form used
    /// by room key backups.
    pub(crate) fn verify_mac(&self, ciphertext: &[u8], mac: &[u8]) -> Result<(), MacError> {
        let expected = self.mac(ciphertext);

        let matches = match mac.len() {
            TRUNCATED_MAC_SIZE => mac.ct_eq(&expected[..TRUNCATED_MAC_SIZE]),
            MAC_SIZE => mac.ct_eq(&expected),
            _ => return Err(MacError),
        };

        if matches.into() {
            Ok(())
        } else {
            Err(MacError)
        }
    }

    fn split_keys(expanded_keys: &[u8; KEY_SIZE * 2]) -> Self {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded_keys[KEY_SIZE..KEY_SIZE * 2]);

        Self { aes_key, mac_key }
    }

    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }
}

/// The key material for one backed-up room key: AES key, MAC key and IV,
/// all derived from the ECDH shared secret of the backup.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct BackupCipherKey {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
    iv: Box<[u8; IV_SIZE]>,
}

impl BackupCipherKey {
    /// Derive the cipher key from the ECDH shared secret of the ephemeral
    /// key and the backup key.
    ///
    /// HKDF-SHA-256 with an empty salt and the `m.megolm_backup.v1` info
    /// string, expanded to 80 bytes: AES key, MAC key, IV.
    pub(crate) fn from_shared_secret(shared_secret: &[u8]) -> Self {
        let mut expanded = [0u8; KEY_SIZE * 2 + IV_SIZE];

        let hkdf: Hkdf<Sha256> = Hkdf::new(None, shared_secret);
        hkdf.expand(MEGOLM_BACKUP_INFO, &mut expanded)
            .expect("We should be able to expand an 80 byte key from HKDF-SHA-256");

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);
        let mut iv = Box::new([0u8; IV_SIZE]);

        aes_key.copy_from_slice(&expanded[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..KEY_SIZE * 2]);
        iv.copy_from_slice(&expanded[KEY_SIZE * 2..]);

        expanded.zeroize();

        Self { aes_key, mac_key, iv }
    }

    /// Encrypt a session export, returning the ciphertext and the truncated
    /// authentication tag.
    pub(crate) fn encrypt(&self, plaintext: Vec<u8>) -> (Vec<u8>, [u8; TRUNCATED_MAC_SIZE]) {
        let mut cipher = Aes256Ctr::new(
            Aes256Key::from_slice(self.aes_key.as_slice()),
            Aes256Iv::from_slice(self.iv.as_slice()),
        );

        let mut ciphertext = plaintext;
        cipher.apply_keystream(&mut ciphertext);

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create an HMAC object from our 32 byte MAC key");
        hmac.update(&ciphertext);
        let mac = hmac.finalize().into_bytes();

        let mut truncated = [0u8; TRUNCATED_MAC_SIZE];
        truncated.copy_from_slice(&mac[..TRUNCATED_MAC_SIZE]);

        (ciphertext, truncated)
    }

    /// Verify the tag and decrypt a session export.
    pub(crate) fn decrypt(&self, ciphertext: Vec<u8>, mac: &[u8]) -> Result<Vec<u8>, MacError> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create an HMAC object from our 32 byte MAC key");
        hmac.update(&ciphertext);
        let expected = hmac.finalize().into_bytes();

        let matches = match mac.len() {
            TRUNCATED_MAC_SIZE => mac.ct_eq(&expected[..TRUNCATED_MAC_SIZE]),
            MAC_SIZE => mac.ct_eq(&expected),
            _ => return Err(MacError),
        };

        if !bool::from(matches) {
            return Err(MacError);
        }

        let mut plaintext = ciphertext;
        let mut cipher = Aes256Ctr::new(
            Aes256Key::from_slice(self.aes_key.as_slice()),
            Aes256Iv::from_slice(self.iv.as_slice()),
        );
        cipher.apply_keystream(&mut plaintext);

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::{AesHmacSha2Key, BackupCipherKey, IV_SIZE};

    #[test]
    fn secret_storage_round_trip() {
        let key = [7u8; 32];
        let cipher = AesHmacSha2Key::from_secret_storage_key(&key, "m.megolm_backup.v1");

        let iv = [1u8; IV_SIZE];
        let ciphertext = cipher.apply_keystream(b"super secret backup key".to_vec(), &iv);
        let mac = cipher.mac(&ciphertext);

        cipher.verify_mac(&ciphertext, &mac).expect("The MAC tag should verify");
        let plaintext = cipher.apply_keystream(ciphertext, &iv);

        assert_eq!(plaintext, b"super secret backup key");
    }

    #[test]
    fn different_secret_names_derive_different_keys() {
        let key = [7u8; 32];
        let a = AesHmacSha2Key::from_secret_storage_key(&key, "m.megolm_backup.v1");
        let b = AesHmacSha2Key::from_secret_storage_key(&key, "m.cross_signing.master");

        let ciphertext = a.apply_keystream(b"payload".to_vec(), &[0u8; IV_SIZE]);
        let mac = a.mac(&ciphertext);

        b.verify_mac(&ciphertext, &mac)
            .expect_err("A key derived with a different secret name must not verify the MAC");
    }

    #[test]
    fn backup_cipher_round_trip_and_tamper_detection() {
        let cipher = BackupCipherKey::from_shared_secret(&[42u8; 32]);

        let (mut ciphertext, mac) = cipher.encrypt(b"exported session".to_vec());

        let plaintext = cipher.decrypt(ciphertext.clone(), &mac).unwrap();
        assert_eq!(plaintext, b"exported session");

        ciphertext[0] ^= 0xff;
        cipher
            .decrypt(ciphertext, &mac)
            .expect_err("A flipped ciphertext byte must fail the MAC check");
    }
}
