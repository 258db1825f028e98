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

//! Two-party SAS verification flows, with the events relayed in memory.

use std::collections::HashMap;

use cinnabar_crypto::{
    requests::{KeysQueryResponse, KeysUploadRequest},
    store::IntoCryptoStore,
    types::DeviceData,
    verification::OutgoingVerificationRequest,
    MemoryStore, OlmMachine, Sas, SasPhase, SyncChanges, VerificationPolicy,
};
use ruma::{device_id, user_id, DeviceId, UserId};
use serde_json::json;

fn alice_id() -> (&'static UserId, &'static DeviceId) {
    (user_id!("@alice:localhost"), device_id!("ALICEDEV"))
}

fn bob_id() -> (&'static UserId, &'static DeviceId) {
    (user_id!("@bob:localhost"), device_id!("BOBDEVICE"))
}

async fn machine(
    user_id: &UserId,
    device_id: &DeviceId,
    policy: VerificationPolicy,
) -> OlmMachine {
    OlmMachine::new(user_id, device_id, MemoryStore::new().into_crypto_store(), policy)
        .await
        .unwrap()
}

/// Let both machines know about each other's device keys.
async fn introduce(alice: &OlmMachine, bob: &OlmMachine) {
    let alice_keys: KeysUploadRequest = alice.keys_for_upload().await.unwrap();
    let bob_keys: KeysUploadRequest = bob.keys_for_upload().await.unwrap();

    let mut device_keys = HashMap::new();
    device_keys.insert(
        alice.user_id().to_owned(),
        HashMap::from([(alice.device_id().to_owned(), alice_keys.device_keys.unwrap())]),
    );
    device_keys.insert(
        bob.user_id().to_owned(),
        HashMap::from([(bob.device_id().to_owned(), bob_keys.device_keys.unwrap())]),
    );

    let response = KeysQueryResponse { device_keys, ..Default::default() };

    alice.receive_keys_query_response(&response).await.unwrap();
    bob.receive_keys_query_response(&response).await.unwrap();
}

async fn device_of(machine: &OlmMachine, user_id: &UserId, device_id: &DeviceId) -> DeviceData {
    machine.store().get_device(user_id, device_id).await.unwrap().unwrap()
}

/// Deliver verification events to a machine through its sync path.
async fn deliver(
    to: &OlmMachine,
    sender: &UserId,
    requests: impl IntoIterator<Item = OutgoingVerificationRequest>,
) {
    let events = requests
        .into_iter()
        .map(|r| {
            json!({
                "sender": sender,
                "type": r.event_type,
                "content": r.content,
            })
        })
        .collect();

    to.receive_sync_changes(SyncChanges { to_device_events: events, ..Default::default() })
        .await
        .unwrap();
}

/// Relay queued verification traffic between the two machines until it
/// dries up.
async fn relay(alice: &OlmMachine, bob: &OlmMachine) {
    loop {
        let from_alice = alice.verification_machine().outgoing_requests();
        let from_bob = bob.verification_machine().outgoing_requests();

        if from_alice.is_empty() && from_bob.is_empty() {
            break;
        }

        deliver(bob, alice.user_id(), from_alice).await;
        deliver(alice, bob.user_id(), from_bob).await;
    }
}

#[tokio::test]
async fn auto_accept_flow_verifies_both_sides() {
    let (alice_user, alice_device) = alice_id();
    let (bob_user, bob_device) = bob_id();

    let alice = machine(alice_user, alice_device, VerificationPolicy::AutoAccept).await;
    let bob = machine(bob_user, bob_device, VerificationPolicy::AutoAccept).await;
    introduce(&alice, &bob).await;

    let alice_device_data = device_of(&bob, alice_user, alice_device).await;
    let bob_sas = bob.verification_machine().start_sas(alice_device_data);

    relay(&alice, &bob).await;

    assert_eq!(bob_sas.phase(), SasPhase::Done);

    let alice_sas = alice
        .verification_machine()
        .get_verification(bob_sas.flow_id())
        .expect("Alice should have a matching verification flow");
    assert_eq!(alice_sas.phase(), SasPhase::Done);

    // The MAC exchange verified the peer device on both sides.
    let bob_seen_by_alice = device_of(&alice, bob_user, bob_device).await;
    assert!(bob_seen_by_alice.is_verified());

    let alice_seen_by_bob = device_of(&bob, alice_user, alice_device).await;
    assert!(alice_seen_by_bob.is_verified());
}

#[tokio::test]
async fn manual_flow_derives_identical_short_auth_strings() {
    let (alice_user, alice_device) = alice_id();
    let (bob_user, bob_device) = bob_id();

    let alice = machine(alice_user, alice_device, VerificationPolicy::Manual).await;
    let bob = machine(bob_user, bob_device, VerificationPolicy::Manual).await;
    introduce(&alice, &bob).await;

    let alice_device_data = device_of(&bob, alice_user, alice_device).await;
    let bob_sas = bob.verification_machine().start_sas(alice_device_data);

    // Bob's start event reaches Alice.
    relay(&alice, &bob).await;

    let alice_sas: Sas = alice
        .verification_machine()
        .get_verification(bob_sas.flow_id())
        .expect("Alice should know the flow after the start event");
    assert_eq!(alice_sas.phase(), SasPhase::Started);

    // Alice accepts; the accept and the following key events flow.
    let accept = alice_sas.accept().expect("Accepting a started flow yields an event");
    deliver(&bob, alice_user, [accept]).await;
    relay(&alice, &bob).await;

    assert_eq!(alice_sas.phase(), SasPhase::KeysExchanged);
    assert_eq!(bob_sas.phase(), SasPhase::KeysExchanged);

    // Both sides must display the same emoji and decimals.
    assert_eq!(alice_sas.emoji().unwrap(), bob_sas.emoji().unwrap());
    assert_eq!(alice_sas.decimals().unwrap(), bob_sas.decimals().unwrap());

    // Both users compare and confirm.
    let alice_macs = alice_sas.confirm();
    deliver(&bob, alice_user, alice_macs).await;
    let bob_macs = bob_sas.confirm();
    deliver(&alice, bob_user, bob_macs).await;
    relay(&alice, &bob).await;

    assert_eq!(alice_sas.phase(), SasPhase::Done);
    assert_eq!(bob_sas.phase(), SasPhase::Done);
}

#[tokio::test]
async fn tampered_mac_cancels_the_flow() {
    let (alice_user, alice_device) = alice_id();
    let (bob_user, bob_device) = bob_id();

    let alice = machine(alice_user, alice_device, VerificationPolicy::Manual).await;
    let bob = machine(bob_user, bob_device, VerificationPolicy::Manual).await;
    introduce(&alice, &bob).await;

    let alice_device_data = device_of(&bob, alice_user, alice_device).await;
    let bob_sas = bob.verification_machine().start_sas(alice_device_data);
    relay(&alice, &bob).await;

    let alice_sas = alice.verification_machine().get_verification(bob_sas.flow_id()).unwrap();
    let accept = alice_sas.accept().unwrap();
    deliver(&bob, alice_user, [accept]).await;
    relay(&alice, &bob).await;

    assert_eq!(bob_sas.phase(), SasPhase::KeysExchanged);

    // Alice confirms, but her MAC event gets garbled in transit.
    let mut macs = alice_sas.confirm();
    assert_eq!(macs.len(), 1);
    macs[0].content["keys"] = json!("dGFtcGVyZWQrbWFjK3ZhbHVl");
    deliver(&bob, alice_user, macs).await;

    assert_eq!(
        bob_sas.phase(),
        SasPhase::Cancelled,
        "A MAC mismatch must cancel the flow, never verify it"
    );

    // Bob's cancellation makes it back to Alice; no state can move after.
    relay(&alice, &bob).await;
    assert_eq!(alice_sas.phase(), SasPhase::Cancelled);

    let bob_seen_by_alice = device_of(&alice, bob_user, bob_device).await;
    assert!(!bob_seen_by_alice.is_verified());
}

#[tokio::test]
async fn cancel_freezes_the_transaction() {
    let (alice_user, alice_device) = alice_id();
    let (bob_user, bob_device) = bob_id();

    let alice = machine(alice_user, alice_device, VerificationPolicy::Manual).await;
    let bob = machine(bob_user, bob_device, VerificationPolicy::Manual).await;
    introduce(&alice, &bob).await;

    let alice_device_data = device_of(&bob, alice_user, alice_device).await;
    let bob_sas = bob.verification_machine().start_sas(alice_device_data);
    relay(&alice, &bob).await;

    let alice_sas = alice.verification_machine().get_verification(bob_sas.flow_id()).unwrap();

    // Bob cancels mid-transaction.
    let cancel = bob_sas
        .cancel(cinnabar_crypto::verification::CancelCode::User)
        .expect("Cancelling an active flow yields an event");
    deliver(&alice, bob_user, [cancel]).await;

    assert_eq!(alice_sas.phase(), SasPhase::Cancelled);

    // A late accept from Alice's side must not revive anything.
    assert!(alice_sas.accept().is_none());
    assert_eq!(alice_sas.phase(), SasPhase::Cancelled);

    // And stray protocol events for the dead transaction are dropped.
    deliver(
        &alice,
        bob_user,
        [OutgoingVerificationRequest {
            to_user_id: alice_user.to_owned(),
            to_device_id: alice_device.to_owned(),
            event_type: "m.key.verification.key".to_owned(),
            content: json!({
                "transaction_id": bob_sas.flow_id().to_string(),
                "key": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            }),
        }],
    )
    .await;

    assert_eq!(alice_sas.phase(), SasPhase::Cancelled);
}
