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

//! Idempotent E2EE bootstrap: discover our own devices, claim one-time
//! keys and establish Olm sessions with them.

use std::{collections::HashMap, sync::Arc};

use cinnabar_crypto::{
    requests::{KeysClaimRequest, KeysQueryRequest},
    LocalTrust, OlmMachine,
};
use ruma::{OwnedDeviceId, OwnedUserId};
use tracing::{debug, info, warn};

use crate::{error::ClientError, transport::HomeserverTransport};

/// What a bootstrap run achieved.
#[derive(Debug, Clone, Default)]
pub struct AutoSetupSummary {
    /// The number of fresh Olm sessions that were established.
    pub sessions_created: usize,
    /// Devices that could not be reached or had no claimable keys.
    pub devices_skipped: usize,
    /// Own devices that were marked verified by policy.
    pub devices_verified: usize,
}

impl AutoSetupSummary {
    fn merge(&mut self, other: AutoSetupSummary) {
        self.sessions_created += other.sessions_created;
        self.devices_skipped += other.devices_skipped;
        self.devices_verified += other.devices_verified;
    }
}

/// The bootstrap orchestrator.
///
/// Every step is idempotent and per-device failures are isolated: one
/// unreachable device never blocks the rest.
pub struct AutoSetup {
    transport: Arc<dyn HomeserverTransport>,
    machine: OlmMachine,
    /// Mark our own devices as verified without an interactive flow.
    ///
    /// This is a trust policy decision, not protocol: it only applies to
    /// devices logged in to our own account.
    pub auto_verify_own_devices: bool,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for AutoSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSetup")
            .field("auto_verify_own_devices", &self.auto_verify_own_devices)
            .finish()
    }
}

impl AutoSetup {
    /// Create a bootstrap orchestrator.
    pub fn new(transport: Arc<dyn HomeserverTransport>, machine: OlmMachine) -> Self {
        Self { transport, machine, auto_verify_own_devices: true }
    }

    /// Run the full bootstrap:
    ///
    /// 1. List our own devices and query their keys.
    /// 2. Claim one-time keys for every device we have no Olm session with
    ///    and create the sessions.
    /// 3. For devices the keys query didn't return, attempt one direct
    ///    claim anyway and retry the query once.
    /// 4. Optionally mark our own devices as verified.
    pub async fn run(&self) -> Result<AutoSetupSummary, ClientError> {
        let mut summary = AutoSetupSummary::default();
        let own_user = self.machine.user_id().to_owned();

        info!("Starting the automatic E2EE setup");

        let devices = self.transport.own_devices().await?;
        debug!(devices = devices.len(), "Listed our own devices");

        // Query all our devices' keys.
        self.machine.update_tracked_users([own_user.as_ref()]).await?;
        let query =
            KeysQueryRequest { device_keys: HashMap::from([(own_user.clone(), Vec::new())]) };
        let response = self.transport.keys_query(&query).await?;
        self.machine.receive_keys_query_response(&response).await?;

        // Establish sessions with every device missing one.
        if let Some(claim) = self.machine.get_missing_sessions([own_user.as_ref()]).await? {
            summary.merge(self.claim_and_create(&claim).await);
        }

        // Devices the query knows nothing about may still have claimable
        // keys; try them directly and re-query once.
        let known: Vec<OwnedDeviceId> = response
            .device_keys
            .get(&own_user)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();

        let unknown: Vec<OwnedDeviceId> = devices
            .iter()
            .map(|d| d.device_id.clone())
            .filter(|id| *id != self.machine.device_id() && !known.contains(id))
            .collect();

        if !unknown.is_empty() {
            warn!(
                devices = ?unknown,
                "Some of our devices have not uploaded any keys, trying a direct claim"
            );
            summary.devices_skipped += self.retry_unknown_devices(&own_user, unknown).await;
        }

        // Publish the cross-signing hierarchy. Re-creating is idempotent
        // locally; the server refuses a conflicting re-upload, which just
        // means the keys are already there.
        match self.machine.bootstrap_cross_signing().await {
            Ok(request) => {
                if let Err(e) = self.transport.upload_signing_keys(&request).await {
                    debug!(
                        error = %e,
                        "Could not upload the cross-signing keys, they probably exist already"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to bootstrap cross-signing"),
        }

        if self.auto_verify_own_devices {
            summary.devices_verified = self.verify_own_devices(&own_user).await?;
        }

        info!(
            sessions_created = summary.sessions_created,
            devices_skipped = summary.devices_skipped,
            devices_verified = summary.devices_verified,
            "The automatic E2EE setup finished"
        );

        Ok(summary)
    }

    async fn claim_and_create(&self, claim: &KeysClaimRequest) -> AutoSetupSummary {
        let mut summary = AutoSetupSummary::default();

        let response = match self.transport.keys_claim(claim).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "The one-time key claim failed");
                summary.devices_skipped +=
                    claim.one_time_keys.values().map(|d| d.len()).sum::<usize>();
                return summary;
            }
        };

        match self.machine.receive_keys_claim_response(&response).await {
            Ok(result) => {
                for (user_id, device_id) in &result.created {
                    debug!(?user_id, ?device_id, "Established a new Olm session");
                }
                for (user_id, device_id, reason) in &result.failed {
                    warn!(?user_id, ?device_id, reason, "Could not establish an Olm session");
                }

                summary.sessions_created += result.created.len();
                summary.devices_skipped += result.failed.len();
            }
            Err(e) => {
                warn!(error = %e, "Failed to process the one-time key claim response");
            }
        }

        summary
    }

    /// One direct claim for devices the keys query skipped, then one more
    /// keys query. Returns the number of devices given up on.
    async fn retry_unknown_devices(
        &self,
        own_user: &OwnedUserId,
        devices: Vec<OwnedDeviceId>,
    ) -> usize {
        let claim = KeysClaimRequest {
            one_time_keys: HashMap::from([(
                own_user.clone(),
                devices
                    .iter()
                    .map(|id| (id.clone(), "signed_curve25519".to_owned()))
                    .collect(),
            )]),
        };

        let claimed: Vec<OwnedDeviceId> = match self.transport.keys_claim(&claim).await {
            Ok(response) => response
                .one_time_keys
                .get(own_user)
                .map(|devices| devices.keys().cloned().collect())
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "The direct one-time key claim failed");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            return devices.len();
        }

        // The claim worked, so the devices do exist; query their keys once
        // more and go through the regular session setup.
        let query = KeysQueryRequest {
            device_keys: HashMap::from([(own_user.clone(), claimed.clone())]),
        };

        match self.transport.keys_query(&query).await {
            Ok(response) => {
                if let Err(e) = self.machine.receive_keys_query_response(&response).await {
                    warn!(error = %e, "Failed to process the retried keys query");
                    return devices.len();
                }
            }
            Err(e) => {
                warn!(error = %e, "The retried keys query failed");
                return devices.len();
            }
        }

        match self.machine.get_missing_sessions([own_user.as_ref()]).await {
            Ok(Some(claim)) => {
                let summary = self.claim_and_create(&claim).await;
                devices.len().saturating_sub(summary.sessions_created)
            }
            Ok(None) => devices.len().saturating_sub(claimed.len()),
            Err(e) => {
                warn!(error = %e, "Failed to compute the missing sessions on retry");
                devices.len()
            }
        }
    }

    async fn verify_own_devices(&self, own_user: &OwnedUserId) -> Result<usize, ClientError> {
        let mut verified = 0;

        for (device_id, device) in self.machine.store().get_user_devices(own_user).await? {
            if device_id == self.machine.device_id() || device.is_verified() {
                continue;
            }

            if self
                .machine
                .set_device_trust(own_user, &device_id, LocalTrust::Verified)
                .await?
            {
                info!(?device_id, "Auto-verified one of our own devices");
                verified += 1;
            }
        }

        Ok(verified)
    }
}
