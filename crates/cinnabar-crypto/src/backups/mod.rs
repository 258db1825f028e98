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

//! Server-side room key backup.
//!
//! Locally held Megolm sessions get encrypted against the backup's public
//! key and uploaded; with the recovery key they can be restored on a new
//! device. The recovery key is validated against the backup's registered
//! public key before any restored content is trusted.

mod keys;
pub mod secret_storage;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use ruma::OwnedRoomId;
use tracing::{debug, info, warn};

pub use keys::{
    BackupDecryptionError, BackupDecryptionKey, DecodeError, MegolmV1BackupKey,
    MEGOLM_BACKUP_V1_ALGORITHM,
};

use crate::{
    olm::InboundGroupSession,
    requests::{BackupAuthData, KeysBackupRequest, RoomKeyBackup},
    store::{BackupKeys, Changes, CryptoStoreError, DynCryptoStore, RoomKeyCounts},
    RoomKeyImportResult,
};

/// How many sessions a single backup upload carries at most.
const BACKUP_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct PendingBackup {
    sessions: Vec<(OwnedRoomId, String)>,
}

/// The machine driving room key backups.
#[derive(Clone)]
pub struct BackupMachine {
    store: Arc<DynCryptoStore>,
    backup_key: Arc<StdRwLock<Option<MegolmV1BackupKey>>>,
    pending_backup: Arc<StdMutex<Option<PendingBackup>>>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupMachine")
            .field("backup_key", &*self.backup_key.read().unwrap())
            .finish()
    }
}

impl BackupMachine {
    pub(crate) fn new(store: Arc<DynCryptoStore>) -> Self {
        Self {
            store,
            backup_key: Default::default(),
            pending_backup: Default::default(),
        }
    }

    /// Is backup enabled, i.e. do we know a backup key and version to
    /// encrypt against.
    pub fn enabled(&self) -> bool {
        self.backup_key.read().unwrap().as_ref().is_some_and(|k| k.backup_version().is_some())
    }

    /// The number of stored room keys and how many of them are backed up.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Enable backing up room keys against the given backup key.
    ///
    /// The key must have its backup version set.
    pub async fn enable_backup_v1(
        &self,
        key: MegolmV1BackupKey,
    ) -> Result<(), CryptoStoreError> {
        if key.backup_version().is_some() {
            *self.backup_key.write().unwrap() = Some(key.clone());
            info!(backup_key = ?key, "Activated a backup");
        } else {
            warn!(backup_key = ?key, "Tried to activate a backup without having the backup key set");
        }

        Ok(())
    }

    /// Disable the backup; pending upload state is dropped.
    pub async fn disable_backup(&self) -> Result<(), CryptoStoreError> {
        *self.backup_key.write().unwrap() = None;
        *self.pending_backup.lock().unwrap() = None;

        self.store.reset_backup_state().await
    }

    /// Persist the recovery key and the version it belongs to.
    pub async fn save_decryption_key(
        &self,
        key: Option<BackupDecryptionKey>,
        version: Option<String>,
    ) -> Result<(), CryptoStoreError> {
        let changes =
            Changes { backup_decryption_key: key, backup_version: version, ..Default::default() };
        self.store.save_changes(changes).await
    }

    /// Load the stored recovery key and backup version.
    pub async fn get_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError> {
        self.store.load_backup_keys().await
    }

    /// Check whether a candidate recovery key matches the registered public
    /// key of a backup version.
    ///
    /// This check gates every restore: accepting content encrypted under an
    /// attacker-chosen key would let the attacker inject room keys.
    pub fn decryption_key_matches(
        decryption_key: &BackupDecryptionKey,
        auth_data: &BackupAuthData,
    ) -> bool {
        decryption_key.megolm_v1_public_key().to_base64() == auth_data.public_key
    }

    /// Collect the next batch of room keys that need backing up and encrypt
    /// them.
    ///
    /// Returns `None` when the backup isn't enabled or nothing is pending.
    /// [`BackupMachine::mark_request_as_sent`] must be called once the
    /// server acknowledged the upload.
    pub async fn backup(
        &self,
    ) -> Result<Option<(String, KeysBackupRequest)>, CryptoStoreError> {
        let Some(backup_key) = self.backup_key.read().unwrap().clone() else {
            return Ok(None);
        };
        let Some(version) = backup_key.backup_version() else {
            return Ok(None);
        };

        let sessions = self.store.inbound_group_sessions_for_backup(BACKUP_BATCH_SIZE).await?;

        if sessions.is_empty() {
            return Ok(None);
        }

        let mut rooms: BTreeMap<OwnedRoomId, RoomKeyBackup> = BTreeMap::new();
        let mut pending = Vec::new();

        for pickle in sessions {
            let session = InboundGroupSession::from_pickle(pickle);
            let room_id = session.room_id.clone();
            let session_id = session.session_id().to_owned();

            let backup_data = backup_key.encrypt(&session).await;

            rooms
                .entry(room_id.clone())
                .or_default()
                .sessions
                .insert(session_id.clone(), backup_data);
            pending.push((room_id, session_id));
        }

        debug!(sessions = pending.len(), version, "Prepared a room key backup upload");

        *self.pending_backup.lock().unwrap() = Some(PendingBackup { sessions: pending });

        Ok(Some((version, KeysBackupRequest { rooms })))
    }

    /// Mark the last prepared backup upload as acknowledged by the server.
    pub async fn mark_request_as_sent(&self) -> Result<(), CryptoStoreError> {
        let Some(pending) = self.pending_backup.lock().unwrap().take() else {
            return Ok(());
        };

        let mut changes = Changes::default();

        for (room_id, session_id) in pending.sessions {
            if let Some(pickle) =
                self.store.get_inbound_group_session(&room_id, &session_id).await?
            {
                let mut session = InboundGroupSession::from_pickle(pickle);
                session.mark_as_backed_up();
                changes.inbound_group_sessions.push(session.pickle().await);
            }
        }

        self.store.save_changes(changes).await
    }

    /// Restore room keys downloaded from a backup.
    ///
    /// Each entry is decrypted and imported on its own; a corrupt or
    /// garbled entry is skipped and counted, it never aborts the whole
    /// restore.
    pub async fn restore(
        &self,
        rooms: &BTreeMap<OwnedRoomId, RoomKeyBackup>,
        decryption_key: &BackupDecryptionKey,
    ) -> Result<RoomKeyImportResult, CryptoStoreError> {
        let mut changes = Changes::default();
        let mut imported = BTreeMap::<OwnedRoomId, std::collections::BTreeSet<String>>::new();
        let mut total = 0usize;
        let mut imported_count = 0usize;

        for (room_id, room_backup) in rooms {
            for (session_id, backup_data) in &room_backup.sessions {
                total += 1;

                let export = match decryption_key.decrypt_session_data(&backup_data.session_data)
                {
                    Ok(export) => export,
                    Err(e) => {
                        warn!(
                            ?room_id,
                            session_id,
                            error = %e,
                            "Skipping a backed up room key that failed to decrypt"
                        );
                        continue;
                    }
                };

                let session = match InboundGroupSession::from_export(&export) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(
                            ?room_id,
                            session_id,
                            error = %e,
                            "Skipping a backed up room key with an invalid ratchet export"
                        );
                        continue;
                    }
                };

                let mut session = session;
                // Keys coming from the backup are in the backup already.
                session.mark_as_backed_up();

                imported
                    .entry(session.room_id.clone())
                    .or_default()
                    .insert(session.session_id().to_owned());
                changes.inbound_group_sessions.push(session.pickle().await);
                imported_count += 1;
            }
        }

        if !changes.inbound_group_sessions.is_empty() {
            self.store.save_changes(changes).await?;
        }

        info!(imported = imported_count, total, "Restored room keys from the backup");

        Ok(RoomKeyImportResult::new(imported_count, total, imported))
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::{BackupDecryptionKey, BackupMachine};
    use crate::{
        olm::{EncryptionSettings, InboundGroupSession, OutboundGroupSession},
        requests::BackupAuthData,
        store::{Changes, CryptoStore, IntoCryptoStore, MemoryStore},
    };

    async fn store_with_sessions(count: usize) -> std::sync::Arc<crate::store::DynCryptoStore> {
        let store = MemoryStore::new().into_crypto_store();
        let mut changes = Changes::default();

        for _ in 0..count {
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

            changes.inbound_group_sessions.push(inbound.pickle().await);
        }

        store.save_changes(changes).await.unwrap();
        store
    }

    #[tokio::test]
    async fn backup_restore_round_trip() {
        let store = store_with_sessions(3).await;
        let machine = BackupMachine::new(store);

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version("1".to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();

        let (version, request) =
            machine.backup().await.unwrap().expect("There should be keys to back up");
        assert_eq!(version, "1");
        machine.mark_request_as_sent().await.unwrap();

        // Restore into a fresh store.
        let restore_machine = BackupMachine::new(
            crate::store::MemoryStore::new().into_crypto_store(),
        );
        let result = restore_machine.restore(&request.rooms, &decryption_key).await.unwrap();

        assert_eq!(result.imported_count, 3);
        assert_eq!(result.total_count, 3);
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_not_fatal() {
        let store = store_with_sessions(2).await;
        let machine = BackupMachine::new(store);

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version("1".to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();

        let (_, mut request) = machine.backup().await.unwrap().unwrap();

        // Garble one of the entries.
        let room = request.rooms.values_mut().next().unwrap();
        let entry = room.sessions.values_mut().next().unwrap();
        entry.session_data.ciphertext = "not base64!!!".to_owned();

        let restore_machine = BackupMachine::new(
            crate::store::MemoryStore::new().into_crypto_store(),
        );
        let result = restore_machine.restore(&request.rooms, &decryption_key).await.unwrap();

        assert_eq!(result.total_count, 2);
        assert_eq!(result.imported_count, 1);
    }

    #[tokio::test]
    async fn backup_is_a_noop_without_a_version() {
        let store = store_with_sessions(1).await;
        let machine = BackupMachine::new(store);

        let decryption_key = BackupDecryptionKey::new();
        machine.enable_backup_v1(decryption_key.megolm_v1_public_key()).await.unwrap();

        assert!(!machine.enabled());
        assert!(machine.backup().await.unwrap().is_none());
    }

    #[test]
    fn decryption_key_match_check() {
        let decryption_key = BackupDecryptionKey::new();
        let auth_data = BackupAuthData {
            public_key: decryption_key.megolm_v1_public_key().to_base64(),
            signatures: Default::default(),
        };

        assert!(BackupMachine::decryption_key_matches(&decryption_key, &auth_data));

        let other = BackupDecryptionKey::new();
        assert!(!BackupMachine::decryption_key_matches(&other, &auth_data));
    }
}
