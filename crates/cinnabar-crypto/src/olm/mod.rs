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

//! The Olm/Megolm state: the long-term account, 1:1 sessions and group
//! sessions.

mod account;
mod group_sessions;
mod session;
pub(crate) mod signing;
pub(crate) mod utility;

pub use account::{Account, OlmMessageHash, OneTimeKeys, PickledAccount, StaticAccountData};
pub use group_sessions::{
    EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession,
    PickledInboundGroupSession, PickledOutboundGroupSession, SessionExpirationStatus,
};
pub use session::{PickledSession, Session};
pub use signing::{PickledCrossSigningIdentity, PrivateCrossSigningIdentity};
pub(crate) use utility::{SignJson, VerifyJson};
