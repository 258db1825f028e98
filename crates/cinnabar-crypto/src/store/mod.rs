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

//! Persistence for the account, sessions and trust decisions.
//!
//! The store is the single source of truth: every mutating crypto operation
//! reads state, advances it and persists it back as one critical section.
//! Two implementations are provided, an in-memory one for tests and a
//! JSON-file-backed one that survives restarts.

mod filestore;
mod memorystore;
mod traits;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use filestore::FileStore;
pub use memorystore::MemoryStore;
pub use traits::{CryptoStore, DynCryptoStore, IntoCryptoStore};

use crate::{
    backups::BackupDecryptionKey,
    olm::{
        OlmMessageHash, PickledAccount, PickledCrossSigningIdentity, PickledInboundGroupSession,
        PickledOutboundGroupSession, PickledSession,
    },
    types::DeviceData,
};

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// An IO error happened while reading from or writing to the backing
    /// storage.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored value couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A stored key was corrupt.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The store backend reported an error.
    #[error("the store backend failed: {0}")]
    Backend(String),
}

/// Shorthand result type for store operations.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The account changes that must be persisted before any other state.
///
/// Kept separate from [`Changes`] because the account pickle must hit
/// storage before messages encrypted with freshly published keys can be
/// acknowledged.
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct PendingChanges {
    /// The pickled account, if it changed.
    pub account: Option<PickledAccount>,
}

/// A batch of state changes persisted atomically via
/// [`CryptoStore::save_changes`].
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct Changes {
    /// Olm sessions whose ratchets advanced.
    pub sessions: Vec<PickledSession>,
    /// New or re-imported inbound group sessions.
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    /// New or advanced outbound group sessions.
    pub outbound_group_sessions: Vec<PickledOutboundGroupSession>,
    /// Device key updates.
    pub devices: DeviceChanges,
    /// A new backup version to remember.
    pub backup_version: Option<String>,
    /// A new backup decryption key to remember.
    pub backup_decryption_key: Option<BackupDecryptionKey>,
    /// The private cross-signing identity, if it changed.
    pub private_identity: Option<PickledCrossSigningIdentity>,
    /// Hashes of received Olm messages, for replay protection.
    pub message_hashes: Vec<OlmMessageHash>,
}

impl Changes {
    /// Is there anything in this batch.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.devices.is_empty()
            && self.backup_version.is_none()
            && self.backup_decryption_key.is_none()
            && self.private_identity.is_none()
            && self.message_hashes.is_empty()
    }
}

/// Device key additions, updates and removals.
#[derive(Debug, Default, Clone)]
pub struct DeviceChanges {
    /// Devices we saw for the first time.
    pub new: Vec<DeviceData>,
    /// Devices whose keys or trust state changed.
    pub changed: Vec<DeviceData>,
    /// Devices that were deleted.
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    /// Is there anything in this batch.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A user whose device list we keep up to date, with a dirty flag that is
/// set when the server tells us the list changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedUser {
    /// The user.
    pub user_id: OwnedUserId,
    /// Whether the locally cached device list is outdated.
    pub dirty: bool,
}

/// How many inbound group sessions exist and how many of them made it into
/// the backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of stored sessions.
    pub total: usize,
    /// The number of sessions that are backed up.
    pub backed_up: usize,
}

/// The backup key material the store holds.
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct BackupKeys {
    /// The recovery key that can decrypt the backup.
    pub decryption_key: Option<BackupDecryptionKey>,
    /// The backup version the key belongs to.
    pub backup_version: Option<String>,
}
