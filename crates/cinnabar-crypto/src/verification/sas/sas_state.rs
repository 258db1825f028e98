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

//! The SAS verification flow as a typestate machine.
//!
//! Each protocol phase is its own type; transitions consume the old state
//! and produce either the next state or a cancellation. An event that
//! doesn't fit the current state can therefore never corrupt it.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ruma::{OwnedTransactionId, UserId};
use tracing::trace;
use vodozemac::{sas::EstablishedSas, sas::Sas as OlmSas, Curve25519PublicKey};

use super::helpers::{
    calculate_commitment, get_decimal, get_emoji, get_mac_content, receive_mac_event, SasIds,
};
use crate::{
    types::DeviceData,
    verification::event_enums::{
        AcceptContent, CancelCode, CancelContent, DoneContent, KeyContent, MacContent,
        StartContent, SAS_V1_METHOD,
    },
};

/// A flow is cancelled if it doesn't complete within this window.
const MAX_AGE: Duration = Duration::from_secs(60 * 5);

/// The key agreement protocols we can negotiate, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreementProtocol {
    /// ECDH over Curve25519 with the SAS bytes derived through HKDF-SHA-256.
    Curve25519HkdfSha256,
}

impl KeyAgreementProtocol {
    /// Our supported protocols in preference order.
    pub const PREFERENCE: &'static [KeyAgreementProtocol] =
        &[KeyAgreementProtocol::Curve25519HkdfSha256];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyAgreementProtocol::Curve25519HkdfSha256 => "curve25519-hkdf-sha256",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "curve25519-hkdf-sha256" => Some(KeyAgreementProtocol::Curve25519HkdfSha256),
            _ => None,
        }
    }
}

/// The hash algorithms we can negotiate for the commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub const PREFERENCE: &'static [HashAlgorithm] = &[HashAlgorithm::Sha256];

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// The MAC methods we can negotiate, strongest first.
///
/// `hkdf-hmac-sha256.v2` produces proper base64 MACs; the legacy
/// `hkdf-hmac-sha256` reproduces a base64 bug of the original libolm
/// implementation and is only kept for interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAuthenticationCode {
    HkdfHmacSha256V2,
    HkdfHmacSha256,
}

impl MessageAuthenticationCode {
    pub const PREFERENCE: &'static [MessageAuthenticationCode] = &[
        MessageAuthenticationCode::HkdfHmacSha256V2,
        MessageAuthenticationCode::HkdfHmacSha256,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageAuthenticationCode::HkdfHmacSha256V2 => "hkdf-hmac-sha256.v2",
            MessageAuthenticationCode::HkdfHmacSha256 => "hkdf-hmac-sha256",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "hkdf-hmac-sha256.v2" => Some(MessageAuthenticationCode::HkdfHmacSha256V2),
            "hkdf-hmac-sha256" => Some(MessageAuthenticationCode::HkdfHmacSha256),
            _ => None,
        }
    }

    /// Calculate a MAC over `input`, bound to the transcript through `info`.
    pub fn calculate_mac(self, sas: &EstablishedSas, input: &str, info: &str) -> String {
        match self {
            MessageAuthenticationCode::HkdfHmacSha256V2 => {
                sas.calculate_mac(input, info).to_base64()
            }
            MessageAuthenticationCode::HkdfHmacSha256 => {
                sas.calculate_mac_invalid_base64(input, info)
            }
        }
    }

    /// Verify a received MAC; any mismatch is a `KeyMismatch` cancellation.
    pub fn verify_mac(
        self,
        sas: &EstablishedSas,
        input: &str,
        info: &str,
        tag: &str,
    ) -> Result<(), CancelCode> {
        match self {
            MessageAuthenticationCode::HkdfHmacSha256V2 => {
                let tag = vodozemac::sas::Mac::from_base64(tag)
                    .map_err(|_| CancelCode::InvalidMessage)?;

                sas.verify_mac(input, info, &tag).map_err(|_| CancelCode::KeyMismatch)
            }
            MessageAuthenticationCode::HkdfHmacSha256 => {
                let expected = sas.calculate_mac_invalid_base64(input, info);

                // The legacy MACs are compared as opaque strings; they don't
                // decode as real base64.
                if expected == tag {
                    Ok(())
                } else {
                    Err(CancelCode::KeyMismatch)
                }
            }
        }
    }
}

/// The ways the short authentication string can be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortAuthString {
    Decimal,
    Emoji,
}

impl ShortAuthString {
    pub const PREFERENCE: &'static [ShortAuthString] =
        &[ShortAuthString::Decimal, ShortAuthString::Emoji];

    pub fn as_str(self) -> &'static str {
        match self {
            ShortAuthString::Decimal => "decimal",
            ShortAuthString::Emoji => "emoji",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "decimal" => Some(ShortAuthString::Decimal),
            "emoji" => Some(ShortAuthString::Emoji),
            _ => None,
        }
    }
}

/// The algorithms both sides agreed to use for a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedProtocols {
    pub key_agreement: KeyAgreementProtocol,
    pub hash: HashAlgorithm,
    pub mac: MessageAuthenticationCode,
    pub short_auth_string: Vec<ShortAuthString>,
}

impl AcceptedProtocols {
    /// Pick the strongest mutually supported algorithms from a start event.
    ///
    /// Preference is decided by our ordered tables, never by the order the
    /// remote listed things in, which keeps downgrade attempts visible.
    pub fn negotiate(start: &StartContent) -> Result<Self, CancelCode> {
        let their_key_agreements: Vec<_> = start
            .key_agreement_protocols
            .iter()
            .filter_map(|s| KeyAgreementProtocol::from_wire(s))
            .collect();
        let their_hashes: Vec<_> =
            start.hashes.iter().filter_map(|s| HashAlgorithm::from_wire(s)).collect();
        let their_macs: Vec<_> = start
            .message_authentication_codes
            .iter()
            .filter_map(|s| MessageAuthenticationCode::from_wire(s))
            .collect();
        let their_sas: Vec<_> = start
            .short_authentication_string
            .iter()
            .filter_map(|s| ShortAuthString::from_wire(s))
            .collect();

        let key_agreement = KeyAgreementProtocol::PREFERENCE
            .iter()
            .find(|p| their_key_agreements.contains(p))
            .copied();
        let hash = HashAlgorithm::PREFERENCE.iter().find(|h| their_hashes.contains(h)).copied();
        let mac = MessageAuthenticationCode::PREFERENCE
            .iter()
            .find(|m| their_macs.contains(m))
            .copied();
        let short_auth_string: Vec<_> = ShortAuthString::PREFERENCE
            .iter()
            .filter(|s| their_sas.contains(s))
            .copied()
            .collect();

        match (key_agreement, hash, mac, short_auth_string.is_empty()) {
            (Some(key_agreement), Some(hash), Some(mac), false) => {
                Ok(Self { key_agreement, hash, mac, short_auth_string })
            }
            _ => Err(CancelCode::UnknownMethod),
        }
    }

    /// Validate the algorithms the other side picked in its accept event.
    pub fn from_accept(accept: &AcceptContent) -> Result<Self, CancelCode> {
        let key_agreement = KeyAgreementProtocol::from_wire(&accept.key_agreement_protocol)
            .ok_or(CancelCode::UnknownMethod)?;
        let hash =
            HashAlgorithm::from_wire(&accept.hash).ok_or(CancelCode::UnknownMethod)?;
        let mac = MessageAuthenticationCode::from_wire(&accept.message_authentication_code)
            .ok_or(CancelCode::UnknownMethod)?;
        let short_auth_string: Vec<_> = accept
            .short_authentication_string
            .iter()
            .filter_map(|s| ShortAuthString::from_wire(s))
            .collect();

        if short_auth_string.is_empty() {
            Err(CancelCode::UnknownMethod)
        } else {
            Ok(Self { key_agreement, hash, mac, short_auth_string })
        }
    }
}

/// The state machine of one SAS flow.
pub struct SasState<S> {
    /// The identities on both ends of the flow.
    pub ids: SasIds,
    /// The transaction id tying all events of the flow together.
    pub flow_id: Arc<OwnedTransactionId>,
    /// When the flow was created, to enforce the timeout.
    pub creation_time: Instant,
    /// Did we send the start event.
    pub we_started: bool,
    /// The phase-specific state.
    pub state: S,
}

/// We sent a start event and are waiting for the other side to accept.
pub struct Created {
    pub sas: OlmSas,
    pub start_content: StartContent,
}

/// The other side sent a start event; we haven't accepted yet.
pub struct Started {
    pub sas: OlmSas,
    pub start_content: StartContent,
    pub protocols: AcceptedProtocols,
}

/// We accepted their start event and committed to our ephemeral key.
pub struct WeAccepted {
    pub sas: OlmSas,
    pub start_content: StartContent,
    pub protocols: AcceptedProtocols,
}

/// They accepted our start event; we know their commitment and have sent
/// our ephemeral key.
pub struct Accepted {
    pub sas: OlmSas,
    pub start_content: StartContent,
    pub protocols: AcceptedProtocols,
    pub commitment: String,
}

/// Both ephemeral keys are known, the shared secret is established and the
/// short auth string can be presented.
pub struct KeysExchanged {
    pub sas: EstablishedSas,
    pub protocols: AcceptedProtocols,
}

/// We confirmed the short auth string and sent our MAC; waiting for theirs.
pub struct Confirmed {
    pub sas: EstablishedSas,
    pub protocols: AcceptedProtocols,
}

/// Their MAC arrived and verified before we confirmed.
pub struct MacReceived {
    pub sas: EstablishedSas,
    pub protocols: AcceptedProtocols,
    pub verified_devices: Vec<DeviceData>,
}

/// The flow completed; the listed devices passed their MAC checks.
#[derive(Debug)]
pub struct Done {
    pub verified_devices: Vec<DeviceData>,
}

/// The flow was cancelled; terminal.
#[derive(Debug)]
pub struct Cancelled {
    pub code: CancelCode,
    pub cancelled_by_us: bool,
}

impl<S> SasState<S> {
    /// Has the flow been running longer than the allowed window.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > MAX_AGE
    }

    fn into_state<T>(self, state: T) -> SasState<T> {
        SasState {
            ids: self.ids,
            flow_id: self.flow_id,
            creation_time: self.creation_time,
            we_started: self.we_started,
            state,
        }
    }

    /// Cancel the flow from any state.
    pub fn into_cancelled(self, cancelled_by_us: bool, code: CancelCode) -> SasState<Cancelled> {
        let state = Cancelled { code, cancelled_by_us };
        self.into_state(state)
    }

    fn check_sender(&self, sender: &UserId) -> Result<(), CancelCode> {
        if sender == self.ids.other_device.user_id() {
            Ok(())
        } else {
            Err(CancelCode::UserMismatch)
        }
    }
}

impl SasState<Cancelled> {
    /// The cancel event content for this cancellation.
    pub fn as_content(&self) -> CancelContent {
        CancelContent {
            transaction_id: (*self.flow_id).clone(),
            code: self.state.code.clone(),
            reason: self.state.code.as_reason().to_owned(),
        }
    }
}

impl SasState<Created> {
    /// Start a new flow towards the given device.
    pub fn new(ids: SasIds, flow_id: OwnedTransactionId) -> Self {
        let sas = OlmSas::new();

        let start_content = StartContent {
            from_device: ids.own_device_id.clone(),
            method: SAS_V1_METHOD.to_owned(),
            transaction_id: flow_id.clone(),
            key_agreement_protocols: KeyAgreementProtocol::PREFERENCE
                .iter()
                .map(|p| p.as_str().to_owned())
                .collect(),
            hashes: HashAlgorithm::PREFERENCE.iter().map(|h| h.as_str().to_owned()).collect(),
            message_authentication_codes: MessageAuthenticationCode::PREFERENCE
                .iter()
                .map(|m| m.as_str().to_owned())
                .collect(),
            short_authentication_string: ShortAuthString::PREFERENCE
                .iter()
                .map(|s| s.as_str().to_owned())
                .collect(),
        };

        Self {
            ids,
            flow_id: flow_id.into(),
            creation_time: Instant::now(),
            we_started: true,
            state: Created { sas, start_content },
        }
    }

    /// The start event content announcing this flow.
    pub fn as_content(&self) -> StartContent {
        self.state.start_content.clone()
    }

    /// Process the accept event of the other side.
    ///
    /// Their commitment gets stored; it is checked once they reveal their
    /// ephemeral key.
    pub fn into_accepted(
        self,
        sender: &UserId,
        content: &AcceptContent,
    ) -> Result<SasState<Accepted>, SasState<Cancelled>> {
        if let Err(code) = self.check_sender(sender) {
            return Err(self.into_cancelled(true, code));
        }

        match AcceptedProtocols::from_accept(content) {
            Ok(protocols) => {
                let SasState { ids, flow_id, creation_time, we_started, state } = self;
                let Created { sas, start_content } = state;

                Ok(SasState {
                    ids,
                    flow_id,
                    creation_time,
                    we_started,
                    state: Accepted {
                        sas,
                        start_content,
                        protocols,
                        commitment: content.commitment.clone(),
                    },
                })
            }
            Err(code) => Err(self.into_cancelled(true, code)),
        }
    }
}

impl SasState<Started> {
    /// Build the state machine for a flow the other side started.
    pub fn from_start_event(
        ids: SasIds,
        flow_id: OwnedTransactionId,
        content: &StartContent,
    ) -> Result<Self, (SasIds, OwnedTransactionId, CancelCode)> {
        if content.method != SAS_V1_METHOD {
            return Err((ids, flow_id, CancelCode::UnknownMethod));
        }

        match AcceptedProtocols::negotiate(content) {
            Ok(protocols) => {
                trace!(?protocols, flow_id = flow_id.as_str(), "Negotiated SAS protocols");

                Ok(Self {
                    ids,
                    flow_id: flow_id.into(),
                    creation_time: Instant::now(),
                    we_started: false,
                    state: Started {
                        sas: OlmSas::new(),
                        start_content: content.clone(),
                        protocols,
                    },
                })
            }
            Err(code) => Err((ids, flow_id, code)),
        }
    }

    /// Accept the flow, committing to our ephemeral public key.
    ///
    /// The commitment binds our key to the exact start event, so we can't
    /// pick our key after seeing theirs.
    pub fn into_we_accepted(self) -> (SasState<WeAccepted>, AcceptContent) {
        let public_key = self.state.sas.public_key();
        let commitment = calculate_commitment(public_key, &self.state.start_content);

        let content = AcceptContent {
            transaction_id: (*self.flow_id).clone(),
            method: SAS_V1_METHOD.to_owned(),
            key_agreement_protocol: self.state.protocols.key_agreement.as_str().to_owned(),
            hash: self.state.protocols.hash.as_str().to_owned(),
            message_authentication_code: self.state.protocols.mac.as_str().to_owned(),
            short_authentication_string: self
                .state
                .protocols
                .short_auth_string
                .iter()
                .map(|s| s.as_str().to_owned())
                .collect(),
            commitment,
        };

        let state = WeAccepted {
            sas: self.state.sas,
            start_content: self.state.start_content,
            protocols: self.state.protocols,
        };

        let sas = SasState {
            ids: self.ids,
            flow_id: self.flow_id,
            creation_time: self.creation_time,
            we_started: false,
            state,
        };

        (sas, content)
    }
}

impl SasState<WeAccepted> {
    /// Process the initiator's ephemeral key, establish the shared secret
    /// and reveal our own key.
    pub fn into_keys_exchanged(
        self,
        sender: &UserId,
        content: &KeyContent,
    ) -> Result<(SasState<KeysExchanged>, KeyContent), SasState<Cancelled>> {
        if let Err(code) = self.check_sender(sender) {
            return Err(self.into_cancelled(true, code));
        }

        let Ok(their_key) = Curve25519PublicKey::from_base64(&content.key) else {
            return Err(self.into_cancelled(true, CancelCode::InvalidMessage));
        };

        let SasState { ids, flow_id, creation_time, we_started, state } = self;
        let WeAccepted { sas, protocols, .. } = state;

        let our_key_content =
            KeyContent { transaction_id: (*flow_id).clone(), key: sas.public_key().to_base64() };

        match sas.diffie_hellman(their_key) {
            Ok(established) => Ok((
                SasState {
                    ids,
                    flow_id,
                    creation_time,
                    we_started,
                    state: KeysExchanged { sas: established, protocols },
                },
                our_key_content,
            )),
            Err(_) => Err(SasState {
                ids,
                flow_id,
                creation_time,
                we_started,
                state: Cancelled { code: CancelCode::InvalidMessage, cancelled_by_us: true },
            }),
        }
    }
}

impl SasState<Accepted> {
    /// Our key event content revealing our ephemeral public key.
    pub fn as_key_content(&self) -> KeyContent {
        KeyContent {
            transaction_id: (*self.flow_id).clone(),
            key: self.state.sas.public_key().to_base64(),
        }
    }

    /// Process the responder's ephemeral key.
    ///
    /// The commitment from the accept event must match the revealed key;
    /// otherwise the responder chose its key after seeing ours and the flow
    /// is cancelled.
    pub fn into_keys_exchanged(
        self,
        sender: &UserId,
        content: &KeyContent,
    ) -> Result<SasState<KeysExchanged>, SasState<Cancelled>> {
        if let Err(code) = self.check_sender(sender) {
            return Err(self.into_cancelled(true, code));
        }

        let Ok(their_key) = Curve25519PublicKey::from_base64(&content.key) else {
            return Err(self.into_cancelled(true, CancelCode::InvalidMessage));
        };

        let commitment = calculate_commitment(their_key, &self.state.start_content);

        if commitment != self.state.commitment {
            return Err(self.into_cancelled(true, CancelCode::MismatchedCommitment));
        }

        let SasState { ids, flow_id, creation_time, we_started, state } = self;
        let Accepted { sas, protocols, .. } = state;

        match sas.diffie_hellman(their_key) {
            Ok(established) => Ok(SasState {
                ids,
                flow_id,
                creation_time,
                we_started,
                state: KeysExchanged { sas: established, protocols },
            }),
            Err(_) => Err(SasState {
                ids,
                flow_id,
                creation_time,
                we_started,
                state: Cancelled { code: CancelCode::InvalidMessage, cancelled_by_us: true },
            }),
        }
    }
}

impl SasState<KeysExchanged> {
    /// The emoji form of the short auth string.
    pub fn get_emoji(&self) -> [crate::verification::Emoji; 7] {
        get_emoji(&self.state.sas, &self.ids, self.flow_id.as_str(), self.we_started)
    }

    /// The decimal form of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(&self.state.sas, &self.ids, self.flow_id.as_str(), self.we_started)
    }

    /// The user confirmed the short auth string matches; send our MACs.
    pub fn confirm(self) -> (SasState<Confirmed>, MacContent) {
        let content = get_mac_content(
            &self.state.sas,
            &self.ids,
            self.flow_id.as_str(),
            self.state.protocols.mac,
        );

        let state = Confirmed { sas: self.state.sas, protocols: self.state.protocols };
        let sas = SasState {
            ids: self.ids,
            flow_id: self.flow_id,
            creation_time: self.creation_time,
            we_started: self.we_started,
            state,
        };

        (sas, content)
    }

    /// Their MAC event arrived before we confirmed.
    ///
    /// All MACs are verified right away; a mismatch cancels the flow.
    pub fn into_mac_received(
        self,
        sender: &UserId,
        content: &MacContent,
    ) -> Result<SasState<MacReceived>, SasState<Cancelled>> {
        if let Err(code) = self.check_sender(sender) {
            return Err(self.into_cancelled(true, code));
        }

        match receive_mac_event(
            &self.state.sas,
            &self.ids,
            self.flow_id.as_str(),
            self.state.protocols.mac,
            content,
        ) {
            Ok(verified_devices) => {
                let state = MacReceived {
                    sas: self.state.sas,
                    protocols: self.state.protocols,
                    verified_devices,
                };

                Ok(SasState {
                    ids: self.ids,
                    flow_id: self.flow_id,
                    creation_time: self.creation_time,
                    we_started: self.we_started,
                    state,
                })
            }
            Err(code) => Err(self.into_cancelled(true, code)),
        }
    }
}

impl SasState<Confirmed> {
    /// Their MAC event arrived after we confirmed; verify it and finish.
    pub fn into_done(
        self,
        sender: &UserId,
        content: &MacContent,
    ) -> Result<(SasState<Done>, DoneContent), SasState<Cancelled>> {
        if let Err(code) = self.check_sender(sender) {
            return Err(self.into_cancelled(true, code));
        }

        match receive_mac_event(
            &self.state.sas,
            &self.ids,
            self.flow_id.as_str(),
            self.state.protocols.mac,
            content,
        ) {
            Ok(verified_devices) => {
                let done = DoneContent { transaction_id: (*self.flow_id).clone() };
                let state = Done { verified_devices };

                Ok((
                    SasState {
                        ids: self.ids,
                        flow_id: self.flow_id,
                        creation_time: self.creation_time,
                        we_started: self.we_started,
                        state,
                    },
                    done,
                ))
            }
            Err(code) => Err(self.into_cancelled(true, code)),
        }
    }
}

impl SasState<MacReceived> {
    /// The emoji form of the short auth string.
    pub fn get_emoji(&self) -> [crate::verification::Emoji; 7] {
        get_emoji(&self.state.sas, &self.ids, self.flow_id.as_str(), self.we_started)
    }

    /// The decimal form of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(&self.state.sas, &self.ids, self.flow_id.as_str(), self.we_started)
    }

    /// The user confirmed the short auth string; send our MACs and finish.
    pub fn confirm(self) -> (SasState<Done>, MacContent, DoneContent) {
        let mac_content = get_mac_content(
            &self.state.sas,
            &self.ids,
            self.flow_id.as_str(),
            self.state.protocols.mac,
        );
        let done_content = DoneContent { transaction_id: (*self.flow_id).clone() };

        let state = Done { verified_devices: self.state.verified_devices };
        let sas = SasState {
            ids: self.ids,
            flow_id: self.flow_id,
            creation_time: self.creation_time,
            we_started: self.we_started,
            state,
        };

        (sas, mac_content, done_content)
    }
}

impl SasState<Done> {
    /// The devices that passed their MAC check in this flow.
    pub fn verified_devices(&self) -> &[DeviceData] {
        &self.state.verified_devices
    }
}
