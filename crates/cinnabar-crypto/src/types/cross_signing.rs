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

use std::collections::BTreeMap;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519PublicKey;

use super::Signatures;

/// The intended usage of a cross-signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// The root of the user's signing hierarchy.
    Master,
    /// Signs the user's own devices.
    SelfSigning,
    /// Signs other users' master keys.
    UserSigning,
}

/// The public part of a cross-signing key, as uploaded to and returned by
/// `/keys/device_signing/upload` and `/keys/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossSigningKey {
    /// The user the key belongs to.
    pub user_id: OwnedUserId,
    /// What the key is used for.
    pub usage: Vec<KeyUsage>,
    /// The public key, keyed by `ed25519:<unpadded base64 of the key>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical JSON form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

impl CrossSigningKey {
    /// Create a new, unsigned cross-signing key for the given public key.
    pub fn new(user_id: OwnedUserId, usage: KeyUsage, public_key: Ed25519PublicKey) -> Self {
        let encoded = public_key.to_base64();

        Self {
            user_id,
            usage: vec![usage],
            keys: BTreeMap::from([(format!("ed25519:{encoded}"), encoded)]),
            signatures: Default::default(),
        }
    }

    /// The first (and in practice only) public key held by this object.
    pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.values().next().and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }
}
