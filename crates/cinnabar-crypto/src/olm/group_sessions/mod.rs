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

mod inbound;
mod outbound;

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession,
    SessionExpirationStatus,
};

/// An exported Megolm session, the form used for `m.forwarded_room_key`
/// events and server-side backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm of the session.
    pub algorithm: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The id of the session.
    pub session_id: String,
    /// The ratchet state, exported at the earliest known index.
    pub session_key: String,
    /// The signing keys the creating device claimed to have.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The chain of devices the session was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}
