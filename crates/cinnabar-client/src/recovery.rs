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

//! Key backup orchestration: opening an existing backup with a recovery
//! key, restoring room keys from it, creating a fresh backup, and keeping
//! it fed.
//!
//! The recovery key the user supplies is only trusted after its derived
//! public key matches the backup version's registered key. When it
//! doesn't match directly, the key may instead open the encrypted backup
//! secret in the user's secret storage; that chain is attempted before
//! giving up.

use std::sync::Arc;

use cinnabar_crypto::{
    backups::{
        secret_storage::{
            decrypt_secret, normalize_secret, EncryptedSecret, BACKUP_SECRET_EVENT,
            DEFAULT_KEY_EVENT, KEY_DESCRIPTION_PREFIX,
        },
        BackupDecryptionKey, BackupMachine, MEGOLM_BACKUP_V1_ALGORITHM,
    },
    requests::{BackupAuthData, BackupVersion},
    OlmMachine, RoomKeyImportResult,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{error::TransportError, transport::HomeserverTransport};

/// Errors of the backup recovery flow.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The homeserver has no key backup.
    #[error("the homeserver has no key backup")]
    NoBackup,

    /// The supplied recovery key couldn't be parsed.
    #[error(transparent)]
    Decode(#[from] cinnabar_crypto::backups::DecodeError),

    /// The key opens neither the backup nor the secret storage.
    #[error(
        "the recovery key matches neither the backup's public key nor a \
        secret storage key"
    )]
    KeyMismatch,

    /// The backup uses an algorithm this client doesn't support.
    #[error("the backup uses an unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The transport layer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The crypto store failed.
    #[error(transparent)]
    Store(#[from] cinnabar_crypto::CryptoStoreError),
}

/// The backup recovery and upload orchestrator.
pub struct BackupRecovery {
    transport: Arc<dyn HomeserverTransport>,
    machine: OlmMachine,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupRecovery").finish()
    }
}

impl BackupRecovery {
    /// Create a recovery orchestrator.
    pub fn new(transport: Arc<dyn HomeserverTransport>, machine: OlmMachine) -> Self {
        Self { transport, machine }
    }

    fn backups(&self) -> &BackupMachine {
        self.machine.backup_machine()
    }

    /// Open the server-side backup with a user-supplied recovery key.
    ///
    /// On success the backup machine is enabled for uploads and the
    /// validated key is persisted. Nothing is decrypted before the
    /// public-key match succeeds.
    pub async fn open(
        &self,
        recovery_key_input: &str,
    ) -> Result<(BackupDecryptionKey, BackupVersion), RecoveryError> {
        let version = self.transport.backup_version().await?.ok_or(RecoveryError::NoBackup)?;

        if version.algorithm != MEGOLM_BACKUP_V1_ALGORITHM {
            return Err(RecoveryError::UnsupportedAlgorithm(version.algorithm));
        }

        let candidate = BackupDecryptionKey::from_str_lossy(recovery_key_input)?;

        let key = if BackupMachine::decryption_key_matches(&candidate, &version.auth_data) {
            info!("The supplied recovery key matches the backup's public key");
            candidate
        } else {
            // The key might be a secret storage key guarding the real one.
            debug!(
                "The supplied key doesn't open the backup directly, \
                trying secret storage"
            );
            let resolved = self
                .resolve_via_secret_storage(&candidate, &version.auth_data)
                .await?
                .ok_or(RecoveryError::KeyMismatch)?;
            info!("Recovered the backup key through secret storage");
            resolved
        };

        let backup_key = key.megolm_v1_public_key();
        backup_key.set_version(version.version.clone());
        self.backups().enable_backup_v1(backup_key).await?;
        self.backups()
            .save_decryption_key(Some(key.clone()), Some(version.version.clone()))
            .await?;

        Ok((key, version))
    }

    /// Walk the secret-storage chain with the supplied key.
    ///
    /// `m.secret_storage.default_key` names the key; if the key
    /// description stores the real secret-storage key encrypted under the
    /// supplied one, it is unwrapped first. The backup secret
    /// (`m.megolm_backup.v1`) is then decrypted and validated against the
    /// backup's public key.
    async fn resolve_via_secret_storage(
        &self,
        provided: &BackupDecryptionKey,
        auth_data: &BackupAuthData,
    ) -> Result<Option<BackupDecryptionKey>, RecoveryError> {
        let user_id = self.machine.user_id();

        let Some(default_key) =
            self.transport.account_data(user_id, DEFAULT_KEY_EVENT).await?
        else {
            return Ok(None);
        };
        let Some(key_id) = default_key.get("key").and_then(|k| k.as_str()) else {
            warn!("The default secret storage key event has no key id");
            return Ok(None);
        };

        debug!(key_id, "Found the default secret storage key");

        // If the key description carries an encrypted copy of the secret
        // storage key, the supplied key may unwrap it.
        let mut ssss_key = *provided.as_bytes();

        let description = self
            .transport
            .account_data(user_id, &format!("{KEY_DESCRIPTION_PREFIX}{key_id}"))
            .await?;

        if let Some(encrypted) =
            description.as_ref().and_then(|d| d.get("encrypted")).and_then(|e| e.as_object())
        {
            for (entry_id, entry) in encrypted {
                let Ok(entry) =
                    serde_json::from_value::<EncryptedSecret>(entry.clone())
                else {
                    continue;
                };

                // The secret storage key itself uses the empty secret name.
                match decrypt_secret(provided.as_bytes(), "", &entry) {
                    Ok(decrypted) => {
                        if let Some(bytes) = normalize_secret(&decrypted) {
                            debug!(entry_id, "Unwrapped the secret storage key");
                            ssss_key.copy_from_slice(&bytes);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(entry_id, error = %e, "The supplied key didn't unwrap this entry");
                    }
                }
            }
        }

        // Decrypt the backup secret with the (possibly unwrapped) key.
        let Some(backup_secret) =
            self.transport.account_data(user_id, BACKUP_SECRET_EVENT).await?
        else {
            return Ok(None);
        };

        let Some(encrypted) = backup_secret
            .get("encrypted")
            .and_then(|e| e.get(key_id))
            .and_then(|e| serde_json::from_value::<EncryptedSecret>(e.clone()).ok())
        else {
            warn!(key_id, "The backup secret isn't encrypted under the default key");
            return Ok(None);
        };

        let decrypted = match decrypt_secret(&ssss_key, BACKUP_SECRET_EVENT, &encrypted) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(error = %e, "The secret storage MAC check failed, the key is wrong");
                return Ok(None);
            }
        };

        let Some(bytes) = normalize_secret(&decrypted) else {
            warn!("The decrypted backup secret has an unexpected shape");
            return Ok(None);
        };

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        let resolved = BackupDecryptionKey::from_bytes(&key);

        // The chain only counts if the resolved key actually opens the
        // backup; accepting anything else would trust attacker-controlled
        // content.
        if BackupMachine::decryption_key_matches(&resolved, auth_data) {
            Ok(Some(resolved))
        } else {
            warn!("The key recovered from secret storage doesn't match the backup either");
            Ok(None)
        }
    }

    /// Download the backup and import every room key the given recovery
    /// key can decrypt. Corrupt entries are skipped and counted.
    pub async fn restore(
        &self,
        key: &BackupDecryptionKey,
        version: &str,
    ) -> Result<RoomKeyImportResult, RecoveryError> {
        let backup = self.transport.backup_keys_get(version).await?;
        let result = self.backups().restore(&backup.rooms, key).await?;

        info!(
            imported = result.imported_count,
            total = result.total_count,
            "Finished restoring room keys from the backup"
        );

        Ok(result)
    }

    /// Create a fresh backup with a newly generated recovery key.
    ///
    /// Returns the key; its grouped Base58 `Display` form is what the user
    /// must write down.
    pub async fn create(&self) -> Result<(BackupDecryptionKey, String), RecoveryError> {
        let key = BackupDecryptionKey::new();
        let backup_key = key.megolm_v1_public_key();

        let auth_data = BackupAuthData {
            public_key: backup_key.to_base64(),
            signatures: Default::default(),
        };

        let version = self
            .transport
            .create_backup_version(MEGOLM_BACKUP_V1_ALGORITHM, &auth_data)
            .await?;

        backup_key.set_version(version.clone());
        self.backups().enable_backup_v1(backup_key).await?;
        self.backups().save_decryption_key(Some(key.clone()), Some(version.clone())).await?;

        info!(version, "Created a new key backup");

        Ok((key, version))
    }

    /// Upload every room key that isn't in the backup yet.
    ///
    /// Returns the number of uploaded keys.
    pub async fn upload_pending(&self) -> Result<usize, RecoveryError> {
        let mut uploaded = 0;

        while let Some((version, request)) = self.backups().backup().await? {
            let count: usize = request.rooms.values().map(|r| r.sessions.len()).sum();

            self.transport.backup_keys_put(&version, &request).await?;
            self.backups().mark_request_as_sent().await?;

            uploaded += count;
        }

        Ok(uploaded)
    }
}
