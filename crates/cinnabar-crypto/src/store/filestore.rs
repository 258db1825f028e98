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

use std::{
    collections::HashMap,
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::{
    BackupKeys, Changes, CryptoStore, PendingChanges, Result, RoomKeyCounts, TrackedUser,
};
use crate::{
    backups::BackupDecryptionKey,
    olm::{
        OlmMessageHash, PickledAccount, PickledCrossSigningIdentity, PickledInboundGroupSession,
        PickledOutboundGroupSession, PickledSession,
    },
    types::DeviceData,
};

const ACCOUNT_FILE: &str = "account.json";
const SESSIONS_FILE: &str = "sessions.json";
const INBOUND_SESSIONS_FILE: &str = "inbound_group_sessions.json";
const OUTBOUND_SESSIONS_FILE: &str = "outbound_group_sessions.json";
const DEVICES_FILE: &str = "devices.json";
const TRACKED_USERS_FILE: &str = "tracked_users.json";
const BACKUP_FILE: &str = "backup.json";
const CROSS_SIGNING_FILE: &str = "cross_signing.json";
const MESSAGE_HASHES_FILE: &str = "message_hashes.json";

#[derive(Serialize, Deserialize)]
struct StoredBackupKeys {
    backup_version: Option<String>,
    decryption_key: Option<String>,
}

/// A [`CryptoStore`] backed by a directory of JSON files.
///
/// One file per concern, mirroring how the state is keyed: the account
/// pickle, Olm sessions per sender key, group sessions per room, device
/// keys and trust per user. Writes go to a temporary file first and are
/// moved into place, so a crash mid-write never corrupts ratchet state.
pub struct FileStore {
    path: PathBuf,
    // Serializes writers; reads go straight to disk.
    write_lock: Mutex<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

impl FileStore {
    /// Open a store under the given directory, creating it if necessary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        fs::create_dir_all(&path)?;

        debug!(path = %path.display(), "Opened a file-backed crypto store");

        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.path.join(file);

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.path.join(file);
        let tmp = self.path.join(format!("{file}.tmp"));

        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn load_sessions(&self) -> Result<HashMap<String, Vec<PickledSession>>> {
        Ok(self.load(SESSIONS_FILE)?.unwrap_or_default())
    }

    fn load_inbound(
        &self,
    ) -> Result<HashMap<OwnedRoomId, HashMap<String, PickledInboundGroupSession>>> {
        Ok(self.load(INBOUND_SESSIONS_FILE)?.unwrap_or_default())
    }

    fn load_devices(
        &self,
    ) -> Result<HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceData>>> {
        Ok(self.load(DEVICES_FILE)?.unwrap_or_default())
    }
}

#[async_trait]
impl CryptoStore for FileStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        self.load(ACCOUNT_FILE)
    }

    async fn save_pending_changes(&self, changes: PendingChanges) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        if let Some(account) = changes.account {
            self.save(ACCOUNT_FILE, &account)?;
        }

        Ok(())
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        if !changes.sessions.is_empty() {
            let mut sessions = self.load_sessions()?;

            for session in changes.sessions {
                let entry = sessions.entry(session.sender_key.to_base64()).or_default();

                if let Some(existing) =
                    entry.iter_mut().find(|s| s.session_id == session.session_id)
                {
                    *existing = session;
                } else {
                    entry.push(session);
                }
            }

            self.save(SESSIONS_FILE, &sessions)?;
        }

        if !changes.inbound_group_sessions.is_empty() {
            let mut inbound = self.load_inbound()?;

            for session in changes.inbound_group_sessions {
                inbound
                    .entry(session.room_id.clone())
                    .or_default()
                    .insert(session.session_id.clone(), session);
            }

            self.save(INBOUND_SESSIONS_FILE, &inbound)?;
        }

        if !changes.outbound_group_sessions.is_empty() {
            let mut outbound: HashMap<OwnedRoomId, PickledOutboundGroupSession> =
                self.load(OUTBOUND_SESSIONS_FILE)?.unwrap_or_default();

            for session in changes.outbound_group_sessions {
                outbound.insert(session.room_id.clone(), session);
            }

            self.save(OUTBOUND_SESSIONS_FILE, &outbound)?;
        }

        if !changes.devices.is_empty() {
            let mut devices = self.load_devices()?;

            for device in changes.devices.new.into_iter().chain(changes.devices.changed) {
                devices
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .insert(device.device_id().to_owned(), device);
            }

            for device in changes.devices.deleted {
                if let Some(user_devices) = devices.get_mut(device.user_id()) {
                    user_devices.remove(device.device_id());
                }
            }

            self.save(DEVICES_FILE, &devices)?;
        }

        if changes.backup_version.is_some() || changes.backup_decryption_key.is_some() {
            let mut stored: StoredBackupKeys =
                self.load(BACKUP_FILE)?.unwrap_or(StoredBackupKeys {
                    backup_version: None,
                    decryption_key: None,
                });

            if let Some(version) = changes.backup_version {
                stored.backup_version = Some(version);
            }
            if let Some(key) = changes.backup_decryption_key {
                stored.decryption_key = Some(key.to_base64());
            }

            self.save(BACKUP_FILE, &stored)?;
        }

        if let Some(identity) = changes.private_identity {
            self.save(CROSS_SIGNING_FILE, &identity)?;
        }

        if !changes.message_hashes.is_empty() {
            let mut hashes: Vec<OlmMessageHash> =
                self.load(MESSAGE_HASHES_FILE)?.unwrap_or_default();

            for hash in changes.message_hashes {
                if !hashes.contains(&hash) {
                    hashes.push(hash);
                }
            }

            self.save(MESSAGE_HASHES_FILE, &hashes)?;
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>> {
        Ok(self.load_sessions()?.remove(sender_key).unwrap_or_default())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>> {
        Ok(self
            .load_inbound()?
            .get_mut(room_id)
            .and_then(|sessions| sessions.remove(session_id)))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        Ok(self
            .load_inbound()?
            .into_values()
            .flat_map(|sessions| sessions.into_values())
            .collect())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let mut counts = RoomKeyCounts::default();

        for session in self.get_inbound_group_sessions().await? {
            counts.total += 1;
            if session.backed_up {
                counts.backed_up += 1;
            }
        }

        Ok(counts)
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>> {
        Ok(self
            .get_inbound_group_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.backed_up)
            .take(limit)
            .collect())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inbound = self.load_inbound()?;

        for session in inbound.values_mut().flat_map(|s| s.values_mut()) {
            session.backed_up = false;
        }

        self.save(INBOUND_SESSIONS_FILE, &inbound)
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        let Some(stored) = self.load::<StoredBackupKeys>(BACKUP_FILE)? else {
            return Ok(BackupKeys::default());
        };

        let decryption_key = stored
            .decryption_key
            .map(|key| {
                BackupDecryptionKey::from_base64(&key)
                    .map_err(|e| super::CryptoStoreError::Backend(e.to_string()))
            })
            .transpose()?;

        Ok(BackupKeys { decryption_key, backup_version: stored.backup_version })
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>> {
        let mut outbound: HashMap<OwnedRoomId, PickledOutboundGroupSession> =
            self.load(OUTBOUND_SESSIONS_FILE)?.unwrap_or_default();

        Ok(outbound.remove(room_id))
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        let tracked: HashMap<OwnedUserId, bool> =
            self.load(TRACKED_USERS_FILE)?.unwrap_or_default();

        Ok(tracked
            .into_iter()
            .map(|(user_id, dirty)| TrackedUser { user_id, dirty })
            .collect())
    }

    async fn save_tracked_users(&self, users: &[(&UserId, bool)]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        let mut tracked: HashMap<OwnedUserId, bool> =
            self.load(TRACKED_USERS_FILE)?.unwrap_or_default();

        for (user_id, dirty) in users {
            tracked.insert((*user_id).to_owned(), *dirty);
        }

        self.save(TRACKED_USERS_FILE, &tracked)
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .load_devices()?
            .get_mut(user_id)
            .and_then(|devices| devices.remove(device_id)))
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        Ok(self.load_devices()?.remove(user_id).unwrap_or_default())
    }

    async fn load_cross_signing_identity(
        &self,
    ) -> Result<Option<PickledCrossSigningIdentity>> {
        self.load(CROSS_SIGNING_FILE)
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        let hashes: Vec<OlmMessageHash> =
            self.load(MESSAGE_HASHES_FILE)?.unwrap_or_default();

        Ok(hashes.contains(message_hash))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::FileStore;
    use crate::{
        store::{CryptoStore, PendingChanges},
        Account,
    };

    #[tokio::test]
    async fn account_survives_a_store_reopen() {
        let dir = std::env::temp_dir().join(format!("cinnabar-store-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEV"));
        let identity_keys = account.identity_keys().clone();

        {
            let store = FileStore::open(&dir).unwrap();
            store
                .save_pending_changes(PendingChanges { account: Some(account.pickle()) })
                .await
                .unwrap();
        }

        let store = FileStore::open(&dir).unwrap();
        let pickle = store
            .load_account()
            .await
            .unwrap()
            .expect("The account should survive a store reopen");

        let restored = Account::from_pickle(pickle);
        assert_eq!(restored.identity_keys().curve25519, identity_keys.curve25519);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
