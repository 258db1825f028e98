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

//! The HTTP boundary towards the homeserver.
//!
//! The crypto engine is transport-agnostic; this trait is the only place
//! where Matrix client-server endpoints appear. The reqwest-backed
//! [`HttpTransport`] is the production implementation, tests plug in
//! scripted mocks.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use cinnabar_crypto::requests::{
    BackupAuthData, BackupVersion, KeysBackupRequest, KeysClaimRequest, KeysClaimResponse,
    KeysQueryRequest, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
    SigningKeysUploadRequest, ToDeviceRequest,
};
use ruma::{OwnedDeviceId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{error::TransportError, sync::SyncResponse};

/// One of our own devices, as listed by `GET /devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnDevice {
    /// The id of the device.
    pub device_id: OwnedDeviceId,
    /// The user-chosen display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// When the device was last seen, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ts: Option<u64>,
}

/// The Matrix client-server endpoints the engine needs.
#[async_trait]
pub trait HomeserverTransport: Send + Sync + fmt::Debug {
    /// Long-poll `GET /sync`.
    async fn sync(
        &self,
        since: Option<String>,
        timeout: Duration,
    ) -> Result<SyncResponse, TransportError>;

    /// `POST /keys/upload`.
    async fn keys_upload(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError>;

    /// `POST /keys/query`.
    async fn keys_query(
        &self,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError>;

    /// `POST /keys/claim`.
    async fn keys_claim(
        &self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// `PUT /sendToDevice/{eventType}/{txnId}`.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;

    /// `POST /keys/device_signing/upload`.
    async fn upload_signing_keys(
        &self,
        request: &SigningKeysUploadRequest,
    ) -> Result<(), TransportError>;

    /// `GET /devices`.
    async fn own_devices(&self) -> Result<Vec<OwnDevice>, TransportError>;

    /// `GET /room_keys/version`; `None` when no backup exists.
    async fn backup_version(&self) -> Result<Option<BackupVersion>, TransportError>;

    /// `POST /room_keys/version`, returning the new version string.
    async fn create_backup_version(
        &self,
        algorithm: &str,
        auth_data: &BackupAuthData,
    ) -> Result<String, TransportError>;

    /// `PUT /room_keys/keys?version=`.
    async fn backup_keys_put(
        &self,
        version: &str,
        request: &KeysBackupRequest,
    ) -> Result<(), TransportError>;

    /// `GET /room_keys/keys?version=`.
    async fn backup_keys_get(
        &self,
        version: &str,
    ) -> Result<KeysBackupRequest, TransportError>;

    /// `GET /user/{userId}/account_data/{type}`; `None` when unset.
    async fn account_data(
        &self,
        user_id: &UserId,
        event_type: &str,
    ) -> Result<Option<Value>, TransportError>;
}

/// A [`HomeserverTransport`] backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    homeserver: Url,
    access_token: String,
    user_id: ruma::OwnedUserId,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("homeserver", &self.homeserver.as_str())
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport for the given homeserver and access token.
    pub fn new(
        homeserver: Url,
        user_id: ruma::OwnedUserId,
        access_token: String,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            // The long-poll timeout of /sync comes on top of this.
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { client, homeserver, access_token, user_id })
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        Ok(self.homeserver.join(&format!("_matrix/client/v3/{path}"))?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Http { status: status.as_u16(), body })
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, TransportError> {
        let response = self
            .client
            .get(self.url(path)?)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: &impl Serialize,
    ) -> Result<Value, TransportError> {
        let response = self
            .client
            .request(method, self.url(path)?)
            .bearer_auth(&self.access_token)
            .query(query)
            .json(body)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl HomeserverTransport for HttpTransport {
    async fn sync(
        &self,
        since: Option<String>,
        timeout: Duration,
    ) -> Result<SyncResponse, TransportError> {
        let mut query = vec![("timeout", timeout.as_millis().to_string())];
        if let Some(since) = since {
            query.push(("since", since));
        }

        let value = self.get_json("sync", &query).await?;

        Ok(serde_json::from_value(value)?)
    }

    async fn keys_upload(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        let value =
            self.send_json(reqwest::Method::POST, "keys/upload", &[], request).await?;

        Ok(serde_json::from_value(value)?)
    }

    async fn keys_query(
        &self,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError> {
        let value = self.send_json(reqwest::Method::POST, "keys/query", &[], request).await?;

        Ok(serde_json::from_value(value)?)
    }

    async fn keys_claim(
        &self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        let value = self.send_json(reqwest::Method::POST, "keys/claim", &[], request).await?;

        Ok(serde_json::from_value(value)?)
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        let path = format!("sendToDevice/{}/{}", request.event_type, request.txn_id);
        let body = serde_json::json!({ "messages": request.messages });

        self.send_json(reqwest::Method::PUT, &path, &[], &body).await?;

        Ok(())
    }

    async fn upload_signing_keys(
        &self,
        request: &SigningKeysUploadRequest,
    ) -> Result<(), TransportError> {
        self.send_json(reqwest::Method::POST, "keys/device_signing/upload", &[], request)
            .await?;

        Ok(())
    }

    async fn own_devices(&self) -> Result<Vec<OwnDevice>, TransportError> {
        #[derive(Deserialize)]
        struct DevicesResponse {
            #[serde(default)]
            devices: Vec<OwnDevice>,
        }

        let value = self.get_json("devices", &[]).await?;
        let response: DevicesResponse = serde_json::from_value(value)?;

        Ok(response.devices)
    }

    async fn backup_version(&self) -> Result<Option<BackupVersion>, TransportError> {
        match self.get_json("room_keys/version", &[]).await {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_backup_version(
        &self,
        algorithm: &str,
        auth_data: &BackupAuthData,
    ) -> Result<String, TransportError> {
        #[derive(Deserialize)]
        struct CreateResponse {
            version: String,
        }

        let body = serde_json::json!({
            "algorithm": algorithm,
            "auth_data": auth_data,
        });

        let value =
            self.send_json(reqwest::Method::POST, "room_keys/version", &[], &body).await?;
        let response: CreateResponse = serde_json::from_value(value)?;

        Ok(response.version)
    }

    async fn backup_keys_put(
        &self,
        version: &str,
        request: &KeysBackupRequest,
    ) -> Result<(), TransportError> {
        self.send_json(
            reqwest::Method::PUT,
            "room_keys/keys",
            &[("version", version.to_owned())],
            request,
        )
        .await?;

        Ok(())
    }

    async fn backup_keys_get(
        &self,
        version: &str,
    ) -> Result<KeysBackupRequest, TransportError> {
        let value =
            self.get_json("room_keys/keys", &[("version", version.to_owned())]).await?;

        Ok(serde_json::from_value(value)?)
    }

    async fn account_data(
        &self,
        user_id: &UserId,
        event_type: &str,
    ) -> Result<Option<Value>, TransportError> {
        let path = format!("user/{user_id}/account_data/{event_type}");

        match self.get_json(&path, &[]).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
