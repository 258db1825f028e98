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

mod helpers;
mod sas_state;

use std::sync::{Arc, Mutex as StdMutex};

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, UserId};
use tracing::trace;

pub use helpers::SasIds;
pub use sas_state::{
    AcceptedProtocols, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthString,
};
use sas_state::{
    Accepted, Cancelled, Confirmed, Created, Done, KeysExchanged, MacReceived, SasState, Started,
    WeAccepted,
};

use super::{
    event_enums::{
        AnyVerificationEvent, CancelCode, OutgoingVerificationRequest, StartContent,
        CANCEL_EVENT, DONE_EVENT, KEY_EVENT, MAC_EVENT, START_EVENT,
    },
    Emoji,
};
use crate::types::DeviceData;

/// The externally visible phase of a SAS flow.
///
/// `Cancelled` is terminal and reachable from every non-terminal phase;
/// `Done` is only reachable through a completed MAC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasPhase {
    /// We sent the start event.
    Created,
    /// The other side sent the start event.
    Started,
    /// One side accepted and committed to the negotiated protocols.
    Accepted,
    /// Both ephemeral keys are exchanged, the short auth string can be
    /// shown.
    KeysExchanged,
    /// We confirmed the short auth string and sent our MACs.
    Confirmed,
    /// The other side's MACs arrived and verified.
    MacReceived,
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled,
}

pub(crate) enum InnerSas {
    Created(SasState<Created>),
    Started(SasState<Started>),
    WeAccepted(SasState<WeAccepted>),
    Accepted(SasState<Accepted>),
    KeysExchanged(SasState<KeysExchanged>),
    Confirmed(SasState<Confirmed>),
    MacReceived(SasState<MacReceived>),
    Done(SasState<Done>),
    Cancelled(SasState<Cancelled>),
}

/// An outgoing event produced by a state transition.
type OutgoingStep = (&'static str, serde_json::Value);

fn step(event_type: &'static str, content: impl serde::Serialize) -> OutgoingStep {
    (
        event_type,
        serde_json::to_value(content).expect("Verification contents can always be serialized"),
    )
}

impl InnerSas {
    fn start(ids: SasIds, flow_id: OwnedTransactionId) -> (Self, StartContent) {
        let sas = SasState::<Created>::new(ids, flow_id);
        let content = sas.as_content();

        (InnerSas::Created(sas), content)
    }

    fn from_start_event(
        ids: SasIds,
        flow_id: OwnedTransactionId,
        content: &StartContent,
    ) -> Result<Self, (SasIds, OwnedTransactionId, CancelCode)> {
        Ok(InnerSas::Started(SasState::<Started>::from_start_event(ids, flow_id, content)?))
    }

    fn accept(self) -> (Self, Option<OutgoingStep>) {
        match self {
            InnerSas::Started(sas) => {
                let (sas, content) = sas.into_we_accepted();
                (InnerSas::WeAccepted(sas), Some(step(super::event_enums::ACCEPT_EVENT, content)))
            }
            other => (other, None),
        }
    }

    fn confirm(self) -> (Self, Vec<OutgoingStep>) {
        match self {
            InnerSas::KeysExchanged(sas) => {
                let (sas, mac) = sas.confirm();
                (InnerSas::Confirmed(sas), vec![step(MAC_EVENT, mac)])
            }
            InnerSas::MacReceived(sas) => {
                let (sas, mac, done) = sas.confirm();
                (InnerSas::Done(sas), vec![step(MAC_EVENT, mac), step(DONE_EVENT, done)])
            }
            other => (other, Vec::new()),
        }
    }

    fn cancel(self, cancelled_by_us: bool, code: CancelCode) -> (Self, Option<OutgoingStep>) {
        let sas = match self {
            InnerSas::Created(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::Started(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::WeAccepted(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::Accepted(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::KeysExchanged(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::Confirmed(s) => s.into_cancelled(cancelled_by_us, code),
            InnerSas::MacReceived(s) => s.into_cancelled(cancelled_by_us, code),
            // Terminal states stay as they are.
            done @ InnerSas::Done(_) => return (done, None),
            cancelled @ InnerSas::Cancelled(_) => return (cancelled, None),
        };

        let content = cancelled_by_us.then(|| step(CANCEL_EVENT, sas.as_content()));

        (InnerSas::Cancelled(sas), content)
    }

    /// The single transition function: apply an inbound event to the
    /// current state.
    ///
    /// Events that don't fit the current state are dropped; failed checks
    /// transition to `Cancelled` and produce the cancel event to send.
    fn receive_any_event(
        self,
        sender: &UserId,
        event: &AnyVerificationEvent,
    ) -> (Self, Vec<OutgoingStep>) {
        match event {
            AnyVerificationEvent::Accept(content) => match self {
                InnerSas::Created(sas) => match sas.into_accepted(sender, content) {
                    Ok(sas) => {
                        // Reveal our ephemeral key now that the other side
                        // has committed to theirs.
                        let key = sas.as_key_content();
                        (InnerSas::Accepted(sas), vec![step(KEY_EVENT, key)])
                    }
                    Err(sas) => {
                        let content = step(CANCEL_EVENT, sas.as_content());
                        (InnerSas::Cancelled(sas), vec![content])
                    }
                },
                other => (other, Vec::new()),
            },
            AnyVerificationEvent::Key(content) => match self {
                InnerSas::Accepted(sas) => match sas.into_keys_exchanged(sender, content) {
                    Ok(sas) => (InnerSas::KeysExchanged(sas), Vec::new()),
                    Err(sas) => {
                        let content = step(CANCEL_EVENT, sas.as_content());
                        (InnerSas::Cancelled(sas), vec![content])
                    }
                },
                InnerSas::WeAccepted(sas) => match sas.into_keys_exchanged(sender, content) {
                    Ok((sas, key)) => {
                        (InnerSas::KeysExchanged(sas), vec![step(KEY_EVENT, key)])
                    }
                    Err(sas) => {
                        let content = step(CANCEL_EVENT, sas.as_content());
                        (InnerSas::Cancelled(sas), vec![content])
                    }
                },
                other => (other, Vec::new()),
            },
            AnyVerificationEvent::Mac(content) => match self {
                InnerSas::KeysExchanged(sas) => match sas.into_mac_received(sender, content) {
                    Ok(sas) => (InnerSas::MacReceived(sas), Vec::new()),
                    Err(sas) => {
                        let content = step(CANCEL_EVENT, sas.as_content());
                        (InnerSas::Cancelled(sas), vec![content])
                    }
                },
                InnerSas::Confirmed(sas) => match sas.into_done(sender, content) {
                    Ok((sas, done)) => (InnerSas::Done(sas), vec![step(DONE_EVENT, done)]),
                    Err(sas) => {
                        let content = step(CANCEL_EVENT, sas.as_content());
                        (InnerSas::Cancelled(sas), vec![content])
                    }
                },
                other => (other, Vec::new()),
            },
            AnyVerificationEvent::Cancel(content) => {
                let (sas, _) = self.cancel(false, content.code.clone());
                (sas, Vec::new())
            }
            // Done just confirms what we already know; request/ready/start
            // are handled a level above.
            AnyVerificationEvent::Done(_)
            | AnyVerificationEvent::Request(_)
            | AnyVerificationEvent::Ready(_)
            | AnyVerificationEvent::Start(_) => (self, Vec::new()),
        }
    }

    fn phase(&self) -> SasPhase {
        match self {
            InnerSas::Created(_) => SasPhase::Created,
            InnerSas::Started(_) => SasPhase::Started,
            InnerSas::WeAccepted(_) | InnerSas::Accepted(_) => SasPhase::Accepted,
            InnerSas::KeysExchanged(_) => SasPhase::KeysExchanged,
            InnerSas::Confirmed(_) => SasPhase::Confirmed,
            InnerSas::MacReceived(_) => SasPhase::MacReceived,
            InnerSas::Done(_) => SasPhase::Done,
            InnerSas::Cancelled(_) => SasPhase::Cancelled,
        }
    }

    fn timed_out(&self) -> bool {
        match self {
            InnerSas::Created(s) => s.timed_out(),
            InnerSas::Started(s) => s.timed_out(),
            InnerSas::WeAccepted(s) => s.timed_out(),
            InnerSas::Accepted(s) => s.timed_out(),
            InnerSas::KeysExchanged(s) => s.timed_out(),
            InnerSas::Confirmed(s) => s.timed_out(),
            InnerSas::MacReceived(s) => s.timed_out(),
            InnerSas::Done(_) | InnerSas::Cancelled(_) => false,
        }
    }

    fn emoji(&self) -> Option<[Emoji; 7]> {
        match self {
            InnerSas::KeysExchanged(s) => Some(s.get_emoji()),
            InnerSas::MacReceived(s) => Some(s.get_emoji()),
            _ => None,
        }
    }

    fn decimals(&self) -> Option<(u16, u16, u16)> {
        match self {
            InnerSas::KeysExchanged(s) => Some(s.get_decimal()),
            InnerSas::MacReceived(s) => Some(s.get_decimal()),
            _ => None,
        }
    }

    fn verified_devices(&self) -> Option<Vec<DeviceData>> {
        match self {
            InnerSas::Done(s) => Some(s.verified_devices().to_vec()),
            _ => None,
        }
    }

    fn cancel_code(&self) -> Option<CancelCode> {
        match self {
            InnerSas::Cancelled(s) => Some(s.state.code.clone()),
            _ => None,
        }
    }
}

/// A single short-authentication-string verification flow with one device.
///
/// Cheap to clone; all clones drive the same underlying state machine.
#[derive(Clone)]
pub struct Sas {
    inner: Arc<StdMutex<Option<InnerSas>>>,
    flow_id: OwnedTransactionId,
    other_user_id: OwnedUserId,
    other_device_id: OwnedDeviceId,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("flow_id", &self.flow_id)
            .field("other_user_id", &self.other_user_id)
            .field("other_device_id", &self.other_device_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Sas {
    /// Start a new flow towards the given device; returns the flow and the
    /// start event to send.
    pub(crate) fn start(
        ids: SasIds,
        flow_id: OwnedTransactionId,
    ) -> (Self, OutgoingVerificationRequest) {
        let other_user_id = ids.other_device.user_id().to_owned();
        let other_device_id = ids.other_device.device_id().to_owned();

        let (inner, content) = InnerSas::start(ids, flow_id.clone());

        let request = OutgoingVerificationRequest::new(
            other_user_id.clone(),
            other_device_id.clone(),
            START_EVENT,
            content,
        );

        (
            Self {
                inner: Arc::new(StdMutex::new(Some(inner))),
                flow_id,
                other_user_id,
                other_device_id,
            },
            request,
        )
    }

    /// Build a flow from a received start event.
    pub(crate) fn from_start_event(
        ids: SasIds,
        flow_id: OwnedTransactionId,
        content: &StartContent,
    ) -> Result<Self, (SasIds, OwnedTransactionId, CancelCode)> {
        let other_user_id = ids.other_device.user_id().to_owned();
        let other_device_id = ids.other_device.device_id().to_owned();

        let inner = InnerSas::from_start_event(ids, flow_id.clone(), content)?;

        Ok(Self {
            inner: Arc::new(StdMutex::new(Some(inner))),
            flow_id,
            other_user_id,
            other_device_id,
        })
    }

    /// The transaction id of this flow.
    pub fn flow_id(&self) -> &ruma::TransactionId {
        &self.flow_id
    }

    /// The user being verified.
    pub fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    /// The device being verified.
    pub fn other_device_id(&self) -> &ruma::DeviceId {
        &self.other_device_id
    }

    /// The current phase of the flow.
    pub fn phase(&self) -> SasPhase {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .phase()
    }

    /// Has the flow finished successfully.
    pub fn is_done(&self) -> bool {
        self.phase() == SasPhase::Done
    }

    /// Has the flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.phase() == SasPhase::Cancelled
    }

    /// The reason the flow was cancelled, if it was.
    pub fn cancel_code(&self) -> Option<CancelCode> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .cancel_code()
    }

    /// Has the flow been running longer than the allowed window.
    pub fn timed_out(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .timed_out()
    }

    /// The emoji to compare, available once the keys are exchanged.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .emoji()
    }

    /// The decimals to compare, available once the keys are exchanged.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .decimals()
    }

    /// The devices that passed their MAC check, once the flow is done.
    pub fn verified_devices(&self) -> Option<Vec<DeviceData>> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .expect("The SAS state machine is always put back")
            .verified_devices()
    }

    /// Accept a flow the other side started.
    pub fn accept(&self) -> Option<OutgoingVerificationRequest> {
        self.transition(|sas| {
            let (sas, content) = sas.accept();
            (sas, content.into_iter().collect())
        })
        .pop()
    }

    /// Confirm that the short authentication string matched.
    pub fn confirm(&self) -> Vec<OutgoingVerificationRequest> {
        self.transition(InnerSas::confirm)
    }

    /// Cancel the flow.
    pub fn cancel(&self, code: CancelCode) -> Option<OutgoingVerificationRequest> {
        self.transition(|sas| {
            let (sas, content) = sas.cancel(true, code);
            (sas, content.into_iter().collect())
        })
        .pop()
    }

    /// Feed an inbound event into the flow, returning the events to send in
    /// response.
    pub(crate) fn receive_any_event(
        &self,
        sender: &UserId,
        event: &AnyVerificationEvent,
    ) -> Vec<OutgoingVerificationRequest> {
        trace!(
            flow_id = self.flow_id.as_str(),
            event_type = event.event_type(),
            "Processing a verification event"
        );

        self.transition(|sas| sas.receive_any_event(sender, event))
    }

    fn transition(
        &self,
        f: impl FnOnce(InnerSas) -> (InnerSas, Vec<OutgoingStep>),
    ) -> Vec<OutgoingVerificationRequest> {
        let mut guard = self.inner.lock().unwrap();

        // Move the state machine out, run the transition, move it back.
        let sas = guard.take().expect("The SAS state machine is always put back");
        let (sas, outgoing) = f(sas);
        *guard = Some(sas);

        outgoing
            .into_iter()
            .map(|(event_type, content)| OutgoingVerificationRequest {
                to_user_id: self.other_user_id.clone(),
                to_device_id: self.other_device_id.clone(),
                event_type: event_type.to_owned(),
                content,
            })
            .collect()
    }
}
