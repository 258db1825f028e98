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
    collections::{HashMap, HashSet},
    fmt,
    sync::RwLock,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};

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

/// An in-memory [`CryptoStore`].
///
/// Loses everything on drop; meant for tests and short-lived tools.
#[derive(Default)]
pub struct MemoryStore {
    account: RwLock<Option<PickledAccount>>,
    sessions: RwLock<HashMap<String, Vec<PickledSession>>>,
    inbound_group_sessions:
        RwLock<HashMap<OwnedRoomId, HashMap<String, PickledInboundGroupSession>>>,
    outbound_group_sessions: RwLock<HashMap<OwnedRoomId, PickledOutboundGroupSession>>,
    devices: RwLock<HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceData>>>,
    tracked_users: RwLock<HashMap<OwnedUserId, bool>>,
    backup_version: RwLock<Option<String>>,
    backup_decryption_key: RwLock<Option<BackupDecryptionKey>>,
    private_identity: RwLock<Option<PickledCrossSigningIdentity>>,
    message_hashes: RwLock<HashSet<OlmMessageHash>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish()
    }
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_changes(&self, changes: Changes) {
        for session in changes.sessions {
            let entry = &mut *self.sessions.write().unwrap();
            let sessions = entry.entry(session.sender_key.to_base64()).or_default();

            if let Some(existing) =
                sessions.iter_mut().find(|s| s.session_id == session.session_id)
            {
                *existing = session;
            } else {
                sessions.push(session);
            }
        }

        for session in changes.inbound_group_sessions {
            self.inbound_group_sessions
                .write()
                .unwrap()
                .entry(session.room_id.clone())
                .or_default()
                .insert(session.session_id.clone(), session);
        }

        for session in changes.outbound_group_sessions {
            self.outbound_group_sessions
                .write()
                .unwrap()
                .insert(session.room_id.clone(), session);
        }

        {
            let devices = &mut *self.devices.write().unwrap();

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
        }

        if let Some(version) = changes.backup_version {
            *self.backup_version.write().unwrap() = Some(version);
        }

        if let Some(key) = changes.backup_decryption_key {
            *self.backup_decryption_key.write().unwrap() = Some(key);
        }

        if let Some(identity) = changes.private_identity {
            *self.private_identity.write().unwrap() = Some(identity);
        }

        for hash in changes.message_hashes {
            self.message_hashes.write().unwrap().insert(hash);
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        let account = self.account.read().unwrap();

        // The pickle isn't `Clone`, round-trip it through serde.
        Ok(match &*account {
            Some(account) => Some(serde_json::from_value(serde_json::to_value(account)?)?),
            None => None,
        })
    }

    async fn save_pending_changes(&self, changes: PendingChanges) -> Result<()> {
        if let Some(account) = changes.account {
            *self.account.write().unwrap() = Some(account);
        }

        Ok(())
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        self.apply_changes(changes);
        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>> {
        let sessions = self.sessions.read().unwrap();

        Ok(match sessions.get(sender_key) {
            Some(sessions) => serde_json::from_value(serde_json::to_value(sessions)?)?,
            None => Vec::new(),
        })
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>> {
        let sessions = self.inbound_group_sessions.read().unwrap();

        Ok(match sessions.get(room_id).and_then(|s| s.get(session_id)) {
            Some(session) => Some(serde_json::from_value(serde_json::to_value(session)?)?),
            None => None,
        })
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        let sessions = self.inbound_group_sessions.read().unwrap();
        let all: Vec<_> = sessions.values().flat_map(|s| s.values()).collect();

        Ok(serde_json::from_value(serde_json::to_value(all)?)?)
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.inbound_group_sessions.read().unwrap();

        let mut counts = RoomKeyCounts::default();
        for session in sessions.values().flat_map(|s| s.values()) {
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
        let sessions = self.inbound_group_sessions.read().unwrap();
        let pending: Vec<_> = sessions
            .values()
            .flat_map(|s| s.values())
            .filter(|s| !s.backed_up)
            .take(limit)
            .collect();

        Ok(serde_json::from_value(serde_json::to_value(pending)?)?)
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let mut sessions = self.inbound_group_sessions.write().unwrap();

        for session in sessions.values_mut().flat_map(|s| s.values_mut()) {
            session.backed_up = false;
        }

        Ok(())
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        Ok(BackupKeys {
            decryption_key: self.backup_decryption_key.read().unwrap().clone(),
            backup_version: self.backup_version.read().unwrap().clone(),
        })
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>> {
        let sessions = self.outbound_group_sessions.read().unwrap();

        Ok(match sessions.get(room_id) {
            Some(session) => Some(serde_json::from_value(serde_json::to_value(session)?)?),
            None => None,
        })
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        Ok(self
            .tracked_users
            .read()
            .unwrap()
            .iter()
            .map(|(user_id, dirty)| TrackedUser { user_id: user_id.clone(), dirty: *dirty })
            .collect())
    }

    async fn save_tracked_users(&self, users: &[(&UserId, bool)]) -> Result<()> {
        let mut tracked = self.tracked_users.write().unwrap();

        for (user_id, dirty) in users {
            tracked.insert((*user_id).to_owned(), *dirty);
        }

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        Ok(self.devices.read().unwrap().get(user_id).cloned().unwrap_or_default())
    }

    async fn load_cross_signing_identity(
        &self,
    ) -> Result<Option<PickledCrossSigningIdentity>> {
        Ok(self.private_identity.read().unwrap().clone())
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        Ok(self.message_hashes.read().unwrap().contains(message_hash))
    }
}
