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

//! The parts of a `GET /sync` response the client consumes.

use std::collections::BTreeMap;

use cinnabar_crypto::DeviceLists;
use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `GET /sync` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The cursor to pass as `since` on the next request.
    pub next_batch: String,
    /// Events sent directly to this device.
    #[serde(default)]
    pub to_device: ToDevice,
    /// Users whose device lists changed.
    #[serde(default)]
    pub device_lists: DeviceLists,
    /// How many one-time keys the server holds for us, per algorithm.
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
    /// The room sections.
    #[serde(default)]
    pub rooms: Rooms,
}

/// The `to_device` section of a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToDevice {
    /// The raw to-device events.
    #[serde(default)]
    pub events: Vec<Value>,
}

/// The `rooms` section of a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rooms {
    /// Rooms the user has joined.
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    /// Rooms the user has been invited to.
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, Value>,
}

/// A joined room in a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    /// The recent timeline events.
    #[serde(default)]
    pub timeline: Timeline,
}

/// The timeline of a joined room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    /// The raw timeline events.
    #[serde(default)]
    pub events: Vec<Value>,
    /// Whether events were skipped since the previous sync.
    #[serde(default)]
    pub limited: bool,
}
