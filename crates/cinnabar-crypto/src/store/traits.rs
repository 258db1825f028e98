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

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, UserId};

use super::{BackupKeys, Changes, PendingChanges, Result, RoomKeyCounts, TrackedUser};
use crate::{
    olm::{
        OlmMessageHash, PickledAccount, PickledCrossSigningIdentity, PickledInboundGroupSession,
        PickledOutboundGroupSession, PickledSession,
    },
    types::DeviceData,
};

/// A type-erased [`CryptoStore`].
pub type DynCryptoStore = dyn CryptoStore + Send + Sync;

/// The storage the `OlmMachine` keeps all E2EE state in.
///
/// Implementations deal in pickled session state; the engine wraps and
/// unwraps the live ratchet objects around store calls.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load the account pickle, if one was stored.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Persist account-level changes.
    ///
    /// This must complete before any dependent [`Changes`] are saved.
    async fn save_pending_changes(&self, changes: PendingChanges) -> Result<()>;

    /// Persist a batch of state changes.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Get all Olm sessions established with the given sender key, in
    /// creation order.
    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>>;

    /// Get the inbound group session with the given id, if we have it.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>>;

    /// Get all stored inbound group sessions.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>>;

    /// Count the stored inbound group sessions and how many are backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts>;

    /// Get up to `limit` inbound group sessions that still need backing up.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>>;

    /// Mark all stored inbound group sessions as not backed up.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Load the stored backup key material.
    async fn load_backup_keys(&self) -> Result<BackupKeys>;

    /// Get the outbound group session for the given room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>>;

    /// Load the users whose device lists we track.
    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>>;

    /// Save tracked users along with their dirty flags.
    async fn save_tracked_users(&self, users: &[(&UserId, bool)]) -> Result<()>;

    /// Get the stored keys and trust state for a single device.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>>;

    /// Get all stored devices of a user.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>>;

    /// Load the private cross-signing identity, if one was stored.
    async fn load_cross_signing_identity(&self)
        -> Result<Option<PickledCrossSigningIdentity>>;

    /// Has the given Olm message been seen before.
    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool>;
}

/// Helper to type-erase a store into an `Arc<DynCryptoStore>`.
pub trait IntoCryptoStore {
    #[doc(hidden)]
    fn into_crypto_store(self) -> Arc<DynCryptoStore>;
}

impl<T> IntoCryptoStore for T
where
    T: CryptoStore + 'static,
{
    fn into_crypto_store(self) -> Arc<DynCryptoStore> {
        Arc::new(self)
    }
}

impl IntoCryptoStore for Arc<DynCryptoStore> {
    fn into_crypto_store(self) -> Arc<DynCryptoStore> {
        self
    }
}
