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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations)]

pub mod backups;
mod ciphers;
mod error;
mod machine;
pub mod olm;
pub mod requests;
pub mod store;
pub mod types;
mod utilities;
pub mod verification;

use std::collections::{BTreeMap, BTreeSet};

use ruma::OwnedRoomId;

pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SessionCreationError,
    SignatureError,
};
pub use machine::{
    DecryptedRoomEvent, DeviceLists, OlmMachine, ProcessedToDeviceEvent,
    SessionCreationSummary, SyncChanges,
};
pub use olm::{Account, EncryptionSettings, Session};
pub use store::{CryptoStore, CryptoStoreError, FileStore, MemoryStore};
pub use types::LocalTrust;
pub use verification::{Emoji, Sas, SasPhase, VerificationMachine, VerificationPolicy};
#[doc(no_inline)]
pub use vodozemac;

/// The result of importing room keys from a backup or an export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys found, including entries that were
    /// skipped because they could not be decrypted or parsed.
    pub total_count: usize,
    /// The imported keys, as a map from the room id to the set of session
    /// ids.
    pub keys: BTreeMap<OwnedRoomId, BTreeSet<String>>,
}

impl RoomKeyImportResult {
    pub(crate) fn new(
        imported_count: usize,
        total_count: usize,
        keys: BTreeMap<OwnedRoomId, BTreeSet<String>>,
    ) -> Self {
        Self { imported_count, total_count, keys }
    }
}

/// The version of the cinnabar-crypto crate being used.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate.
#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
