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

//! Interactive device verification.
//!
//! Verification flows are driven entirely by inbound protocol events; the
//! machine here owns the per-transaction state machines, applies policy
//! (auto-accept, auto-reject, manual) and records trust decisions in the
//! store once, and only once, a MAC exchange completed.

pub mod event_enums;
mod sas;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use tracing::{debug, info, trace, warn};

pub use event_enums::{AnyVerificationEvent, CancelCode, OutgoingVerificationRequest};
pub use sas::{Sas, SasIds, SasPhase};

use event_enums::{ReadyContent, RequestContent, SAS_V1_METHOD};

use crate::{
    olm::StaticAccountData,
    store::{Changes, CryptoStoreError, DynCryptoStore},
    types::{DeviceData, LocalTrust},
};

/// An emoji of the short authentication string, with its spec-defined
/// description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emoji {
    /// The emoji symbol.
    pub symbol: &'static str,
    /// The English description of the symbol.
    pub description: &'static str,
}

/// How the machine responds to inbound verification requests.
///
/// This is configuration, not protocol: no policy setting ever marks a
/// device trusted without a completed MAC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationPolicy {
    /// Accept requests, negotiate and confirm automatically.
    #[default]
    AutoAccept,
    /// Reject every inbound request.
    AutoReject,
    /// Record requests and wait for explicit accept/confirm calls.
    Manual,
}

/// The state machine collection driving all verification flows.
#[derive(Clone)]
pub struct VerificationMachine {
    own_user_id: OwnedUserId,
    own_device_id: OwnedDeviceId,
    own_identity_keys: Arc<vodozemac::olm::IdentityKeys>,
    store: Arc<DynCryptoStore>,
    policy: VerificationPolicy,
    verifications: Arc<StdMutex<HashMap<OwnedTransactionId, Sas>>>,
    requests: Arc<StdMutex<HashMap<OwnedTransactionId, (OwnedUserId, RequestContent)>>>,
    outgoing: Arc<StdMutex<Vec<OutgoingVerificationRequest>>>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for VerificationMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationMachine")
            .field("own_user_id", &self.own_user_id)
            .field("own_device_id", &self.own_device_id)
            .field("policy", &self.policy)
            .finish()
    }
}

impl VerificationMachine {
    pub(crate) fn new(
        account: &StaticAccountData,
        store: Arc<DynCryptoStore>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            own_user_id: account.user_id.clone(),
            own_device_id: account.device_id.clone(),
            own_identity_keys: account.identity_keys.clone(),
            store,
            policy,
            verifications: Default::default(),
            requests: Default::default(),
            outgoing: Default::default(),
        }
    }

    fn sas_ids(&self, other_device: DeviceData) -> SasIds {
        SasIds {
            own_user_id: self.own_user_id.clone(),
            own_device_id: self.own_device_id.clone(),
            own_identity_keys: self.own_identity_keys.clone(),
            other_device,
        }
    }

    /// The policy this machine runs under.
    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    /// Get the flow with the given transaction id, if it exists.
    pub fn get_verification(&self, flow_id: &TransactionId) -> Option<Sas> {
        self.verifications.lock().unwrap().get(flow_id).cloned()
    }

    /// Ask another device to verify with us.
    pub fn request_verification(&self, device: &DeviceData) -> OwnedTransactionId {
        let transaction_id = TransactionId::new();

        let content = RequestContent {
            from_device: self.own_device_id.clone(),
            methods: vec![SAS_V1_METHOD.to_owned()],
            transaction_id: transaction_id.clone(),
            timestamp: None,
        };

        self.queue(OutgoingVerificationRequest::new(
            device.user_id().to_owned(),
            device.device_id().to_owned(),
            event_enums::REQUEST_EVENT,
            content,
        ));

        transaction_id
    }

    /// Start a SAS flow with the given device right away.
    pub fn start_sas(&self, device: DeviceData) -> Sas {
        let flow_id = TransactionId::new();
        let (sas, request) = Sas::start(self.sas_ids(device), flow_id.clone());

        self.queue(request);
        self.verifications.lock().unwrap().insert(flow_id, sas.clone());

        sas
    }

    /// Drain the queued outgoing verification events.
    ///
    /// Also sweeps timed-out flows, turning them into cancellations.
    pub fn outgoing_requests(&self) -> Vec<OutgoingVerificationRequest> {
        self.garbage_collect();
        std::mem::take(&mut *self.outgoing.lock().unwrap())
    }

    fn garbage_collect(&self) {
        let verifications = self.verifications.lock().unwrap();

        for sas in verifications.values() {
            if sas.timed_out() {
                debug!(flow_id = sas.flow_id().as_str(), "Cancelling a timed out verification");

                if let Some(request) = sas.cancel(CancelCode::Timeout) {
                    self.outgoing.lock().unwrap().push(request);
                }
            }
        }
    }

    fn queue(&self, request: OutgoingVerificationRequest) {
        self.outgoing.lock().unwrap().push(request);
    }

    /// Feed a verification to-device event into the machine.
    ///
    /// Events for unknown or already-terminal transactions are dropped, not
    /// errors; a verification flow must stay robust against stray traffic.
    pub async fn receive_any_event(
        &self,
        sender: &UserId,
        event: &AnyVerificationEvent,
    ) -> Result<(), CryptoStoreError> {
        match event {
            AnyVerificationEvent::Request(content) => {
                self.receive_request(sender, content).await
            }
            AnyVerificationEvent::Ready(content) => self.receive_ready(sender, content).await,
            AnyVerificationEvent::Start(content) => self.receive_start(sender, content).await,
            _ => {
                let flow_id = event.transaction_id().to_owned();

                let Some(sas) = self.get_verification(&flow_id) else {
                    trace!(
                        flow_id = flow_id.as_str(),
                        event_type = event.event_type(),
                        "Dropping a verification event for an unknown transaction"
                    );
                    return Ok(());
                };

                for request in sas.receive_any_event(sender, event) {
                    self.queue(request);
                }

                if self.policy == VerificationPolicy::AutoAccept
                    && sas.phase() == SasPhase::KeysExchanged
                {
                    if let Some(emoji) = sas.emoji() {
                        let emoji: Vec<_> = emoji.iter().map(|e| e.symbol).collect();
                        info!(
                            flow_id = flow_id.as_str(),
                            emoji = emoji.join(" "),
                            "Presenting the short authentication string"
                        );
                    }

                    for request in sas.confirm() {
                        self.queue(request);
                    }
                }

                if sas.is_done() {
                    self.mark_as_verified(&sas).await?;
                }

                Ok(())
            }
        }
    }

    async fn receive_request(
        &self,
        sender: &UserId,
        content: &RequestContent,
    ) -> Result<(), CryptoStoreError> {
        debug!(
            ?sender,
            from_device = ?content.from_device,
            methods = ?content.methods,
            "Received a verification request"
        );

        self.requests
            .lock()
            .unwrap()
            .insert(content.transaction_id.clone(), (sender.to_owned(), content.clone()));

        match self.policy {
            VerificationPolicy::AutoReject => {
                self.queue(cancel_request(
                    sender.to_owned(),
                    content.from_device.clone(),
                    &content.transaction_id,
                    CancelCode::User,
                ));
            }
            VerificationPolicy::Manual => {
                // Recorded; the caller decides through `accept_request`.
            }
            VerificationPolicy::AutoAccept => {
                if content.methods.iter().any(|m| m == SAS_V1_METHOD) {
                    let ready = ReadyContent {
                        from_device: self.own_device_id.clone(),
                        methods: vec![SAS_V1_METHOD.to_owned()],
                        transaction_id: content.transaction_id.clone(),
                    };

                    self.queue(OutgoingVerificationRequest::new(
                        sender.to_owned(),
                        content.from_device.clone(),
                        event_enums::READY_EVENT,
                        ready,
                    ));
                } else {
                    self.queue(cancel_request(
                        sender.to_owned(),
                        content.from_device.clone(),
                        &content.transaction_id,
                        CancelCode::UnknownMethod,
                    ));
                }
            }
        }

        Ok(())
    }

    async fn receive_ready(
        &self,
        sender: &UserId,
        content: &ReadyContent,
    ) -> Result<(), CryptoStoreError> {
        if self.policy != VerificationPolicy::AutoAccept {
            return Ok(());
        }

        if self.get_verification(&content.transaction_id).is_some() {
            return Ok(());
        }

        // The other side is ready for the request we sent; start SAS.
        let Some(device) = self.store.get_device(sender, &content.from_device).await? else {
            warn!(
                ?sender,
                device_id = ?content.from_device,
                "A device we don't know about answered a verification request"
            );
            return Ok(());
        };

        let (sas, request) =
            Sas::start(self.sas_ids(device), content.transaction_id.clone());

        self.queue(request);
        self.verifications.lock().unwrap().insert(content.transaction_id.clone(), sas);

        Ok(())
    }

    async fn receive_start(
        &self,
        sender: &UserId,
        content: &event_enums::StartContent,
    ) -> Result<(), CryptoStoreError> {
        let flow_id = content.transaction_id.clone();

        if self.get_verification(&flow_id).is_some() {
            trace!(flow_id = flow_id.as_str(), "Ignoring a duplicate start event");
            return Ok(());
        }

        let Some(device) = self.store.get_device(sender, &content.from_device).await? else {
            warn!(
                ?sender,
                device_id = ?content.from_device,
                "An unknown device tried to start a verification"
            );
            return Ok(());
        };

        match Sas::from_start_event(self.sas_ids(device), flow_id.clone(), content) {
            Ok(sas) => {
                self.verifications.lock().unwrap().insert(flow_id, sas.clone());

                match self.policy {
                    VerificationPolicy::AutoAccept => {
                        if let Some(request) = sas.accept() {
                            self.queue(request);
                        }
                    }
                    VerificationPolicy::AutoReject => {
                        if let Some(request) = sas.cancel(CancelCode::User) {
                            self.queue(request);
                        }
                    }
                    VerificationPolicy::Manual => {}
                }
            }
            Err((_, _, code)) => {
                self.queue(cancel_request(
                    sender.to_owned(),
                    content.from_device.clone(),
                    &flow_id,
                    code,
                ));
            }
        }

        Ok(())
    }

    /// Accept a previously recorded verification request (manual mode).
    pub fn accept_request(&self, flow_id: &TransactionId) -> bool {
        let Some((sender, request)) = self.requests.lock().unwrap().get(flow_id).cloned()
        else {
            return false;
        };

        let ready = ReadyContent {
            from_device: self.own_device_id.clone(),
            methods: vec![SAS_V1_METHOD.to_owned()],
            transaction_id: request.transaction_id.clone(),
        };

        self.queue(OutgoingVerificationRequest::new(
            sender,
            request.from_device.clone(),
            event_enums::READY_EVENT,
            ready,
        ));

        true
    }

    /// Record the devices a finished flow verified.
    async fn mark_as_verified(&self, sas: &Sas) -> Result<(), CryptoStoreError> {
        let Some(devices) = sas.verified_devices() else {
            return Ok(());
        };

        let mut changes = Changes::default();

        for mut device in devices {
            info!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                "Marking a device as verified after a successful interactive verification"
            );

            device.local_trust = LocalTrust::Verified;
            changes.devices.changed.push(device);
        }

        if !changes.is_empty() {
            self.store.save_changes(changes).await?;
        }

        Ok(())
    }
}

fn cancel_request(
    to_user_id: OwnedUserId,
    to_device_id: OwnedDeviceId,
    flow_id: &TransactionId,
    code: CancelCode,
) -> OutgoingVerificationRequest {
    let reason = code.as_reason().to_owned();

    OutgoingVerificationRequest::new(
        to_user_id,
        to_device_id,
        event_enums::CANCEL_EVENT,
        event_enums::CancelContent { transaction_id: flow_id.to_owned(), code, reason },
    )
}
