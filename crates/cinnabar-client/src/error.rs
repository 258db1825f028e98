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

use thiserror::Error;

/// A network or homeserver failure.
///
/// Transport errors are retried with a backoff at the sync-loop level;
/// individual crypto operations never retry them silently.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The homeserver answered with a non-success status code.
    #[error("the homeserver returned {status}: {body}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The response body, usually a Matrix error object.
        body: String,
    },

    /// The request never made it to the homeserver.
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    /// The response body couldn't be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The homeserver URL is malformed.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl TransportError {
    /// Is this a "not found" answer from the server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::Http { status: 404, .. })
    }
}

/// Any failure of the client shell.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport layer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A device to device crypto operation failed.
    #[error(transparent)]
    Olm(#[from] cinnabar_crypto::OlmError),

    /// A group crypto operation failed.
    #[error(transparent)]
    Megolm(#[from] cinnabar_crypto::MegolmError),

    /// The crypto store failed.
    #[error(transparent)]
    Store(#[from] cinnabar_crypto::CryptoStoreError),
}
