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

//! Sync-loop behavior against a scripted in-memory homeserver.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use cinnabar_client::{
    sync::{shutdown_channel, SyncResponse},
    HomeserverTransport, OwnDevice, SyncHandler, SyncService, SyncSettings, TimelineEvent,
    TransportError,
};
use cinnabar_crypto::{
    requests::{
        BackupAuthData, BackupVersion, KeysBackupRequest, KeysClaimRequest, KeysClaimResponse,
        KeysQueryRequest, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
        SigningKeysUploadRequest, ToDeviceRequest,
    },
    store::IntoCryptoStore,
    MemoryStore, OlmMachine, ProcessedToDeviceEvent, VerificationPolicy,
};
use ruma::{device_id, room_id, user_id, DeviceId, UserId};
use serde_json::{json, Value};

#[derive(Debug, Default)]
struct MockTransport {
    sync_responses: Mutex<VecDeque<SyncResponse>>,
    sent_to_device: Mutex<Vec<ToDeviceRequest>>,
    devices: Mutex<Vec<OwnDevice>>,
    query_response: Mutex<KeysQueryResponse>,
    claim_response: Mutex<KeysClaimResponse>,
    account_data: Mutex<HashMap<String, Value>>,
    backup: Mutex<Option<BackupVersion>>,
    backup_keys: Mutex<KeysBackupRequest>,
    otk_count: Mutex<u64>,
}

#[async_trait]
impl HomeserverTransport for MockTransport {
    async fn sync(
        &self,
        _since: Option<String>,
        _timeout: Duration,
    ) -> Result<SyncResponse, TransportError> {
        let next = self.sync_responses.lock().unwrap().pop_front();

        match next {
            Some(response) => Ok(response),
            // Simulate a long poll that never returns.
            None => std::future::pending().await,
        }
    }

    async fn keys_upload(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        let mut count = self.otk_count.lock().unwrap();
        *count += request.one_time_keys.len() as u64;

        Ok(KeysUploadResponse {
            one_time_key_counts: [("signed_curve25519".to_owned(), *count)].into(),
        })
    }

    async fn keys_query(
        &self,
        _request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError> {
        Ok(self.query_response.lock().unwrap().clone())
    }

    async fn keys_claim(
        &self,
        _request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        Ok(self.claim_response.lock().unwrap().clone())
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        self.sent_to_device.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn upload_signing_keys(
        &self,
        _request: &SigningKeysUploadRequest,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn own_devices(&self) -> Result<Vec<OwnDevice>, TransportError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn backup_version(&self) -> Result<Option<BackupVersion>, TransportError> {
        Ok(self.backup.lock().unwrap().clone())
    }

    async fn create_backup_version(
        &self,
        algorithm: &str,
        auth_data: &BackupAuthData,
    ) -> Result<String, TransportError> {
        let version = BackupVersion {
            algorithm: algorithm.to_owned(),
            auth_data: auth_data.clone(),
            version: "1".to_owned(),
            count: 0,
            etag: String::new(),
        };
        *self.backup.lock().unwrap() = Some(version);

        Ok("1".to_owned())
    }

    async fn backup_keys_put(
        &self,
        _version: &str,
        request: &KeysBackupRequest,
    ) -> Result<(), TransportError> {
        let mut stored = self.backup_keys.lock().unwrap();

        for (room_id, room) in &request.rooms {
            let entry = stored.rooms.entry(room_id.clone()).or_default();
            entry.sessions.extend(room.sessions.clone());
        }

        Ok(())
    }

    async fn backup_keys_get(
        &self,
        _version: &str,
    ) -> Result<KeysBackupRequest, TransportError> {
        Ok(self.backup_keys.lock().unwrap().clone())
    }

    async fn account_data(
        &self,
        _user_id: &UserId,
        event_type: &str,
    ) -> Result<Option<Value>, TransportError> {
        Ok(self.account_data.lock().unwrap().get(event_type).cloned())
    }
}

#[derive(Debug, Default)]
struct RecordingHandler {
    room_events: Mutex<Vec<TimelineEvent>>,
    invites: Mutex<Vec<ruma::OwnedRoomId>>,
    to_device: Mutex<Vec<ProcessedToDeviceEvent>>,
}

#[async_trait]
impl SyncHandler for RecordingHandler {
    async fn on_room_event(&self, event: TimelineEvent) {
        self.room_events.lock().unwrap().push(event);
    }

    async fn on_invite(&self, room_id: &ruma::RoomId) {
        self.invites.lock().unwrap().push(room_id.to_owned());
    }

    async fn on_to_device(&self, event: ProcessedToDeviceEvent) {
        self.to_device.lock().unwrap().push(event);
    }
}

fn alice_id() -> (&'static UserId, &'static DeviceId) {
    (user_id!("@alice:localhost"), device_id!("ALICEDEV"))
}

fn bob_id() -> (&'static UserId, &'static DeviceId) {
    (user_id!("@bob:localhost"), device_id!("BOBDEVICE"))
}

async fn machine(user_id: &UserId, device_id: &DeviceId) -> OlmMachine {
    OlmMachine::new(
        user_id,
        device_id,
        MemoryStore::new().into_crypto_store(),
        VerificationPolicy::AutoAccept,
    )
    .await
    .unwrap()
}

/// Introduce two machines and give `sender` an Olm session towards
/// `receiver`.
async fn connect(sender: &OlmMachine, receiver: &OlmMachine) {
    let sender_keys = sender.keys_for_upload().await.unwrap();
    let receiver_keys = receiver.keys_for_upload().await.unwrap();

    let response = KeysQueryResponse {
        device_keys: [
            (
                sender.user_id().to_owned(),
                HashMap::from([(
                    sender.device_id().to_owned(),
                    sender_keys.device_keys.unwrap(),
                )]),
            ),
            (
                receiver.user_id().to_owned(),
                HashMap::from([(
                    receiver.device_id().to_owned(),
                    receiver_keys.device_keys.unwrap(),
                )]),
            ),
        ]
        .into(),
        ..Default::default()
    };

    sender.receive_keys_query_response(&response).await.unwrap();
    receiver.receive_keys_query_response(&response).await.unwrap();

    let (key_id, key) = receiver_keys.one_time_keys.iter().next().unwrap();
    let claim = KeysClaimResponse {
        one_time_keys: [(
            receiver.user_id().to_owned(),
            [(
                receiver.device_id().to_owned(),
                [(key_id.clone(), key.clone())].into(),
            )]
            .into(),
        )]
        .into(),
        ..Default::default()
    };

    let summary = sender.receive_keys_claim_response(&claim).await.unwrap();
    assert_eq!(summary.created.len(), 1);
}

fn service(
    transport: Arc<MockTransport>,
    machine: OlmMachine,
    handler: Arc<RecordingHandler>,
) -> SyncService {
    SyncService::new(
        transport,
        machine,
        handler,
        SyncSettings { backoff: Duration::from_millis(10), ..Default::default() },
    )
}

#[tokio::test]
async fn room_key_in_the_same_sync_decrypts_the_timeline() {
    let (alice_user, alice_device) = alice_id();
    let (bob_user, bob_device) = bob_id();
    let room_id = room_id!("!room:localhost");

    let alice = machine(alice_user, alice_device).await;
    let bob = machine(bob_user, bob_device).await;
    connect(&alice, &bob).await;

    // Alice shares a room key with Bob and encrypts a message.
    let mut share_requests = alice
        .share_room_key(room_id, [bob_user], Default::default())
        .await
        .unwrap();
    let room_key_content =
        share_requests.remove(0).messages[bob_user][bob_device].clone();

    let encrypted = alice
        .encrypt_room_event(room_id, "m.room.message", json!({"body": "hello bob"}))
        .await
        .unwrap();

    // Both the room key and the encrypted message arrive in one sync. The
    // fixed dispatch order (to-device before timelines) makes the message
    // decryptable immediately.
    let response: SyncResponse = serde_json::from_value(json!({
        "next_batch": "batch-1",
        "to_device": {
            "events": [{
                "sender": alice_user,
                "type": "m.room.encrypted",
                "content": room_key_content,
            }]
        },
        "rooms": {
            "join": {
                "!room:localhost": {
                    "timeline": {
                        "events": [{
                            "event_id": "$encrypted-event",
                            "sender": alice_user,
                            "type": "m.room.encrypted",
                            "content": serde_json::to_value(&encrypted).unwrap(),
                        }]
                    }
                }
            }
        }
    }))
    .unwrap();

    let transport = Arc::new(MockTransport::default());
    transport.sync_responses.lock().unwrap().push_back(response);

    let handler = Arc::new(RecordingHandler::default());
    let service = service(transport, bob, handler.clone());

    service.sync_once().await.unwrap();

    let events = handler.room_events.lock().unwrap();
    assert_eq!(events.len(), 1);

    let decrypted = events[0].decrypted.as_ref().expect("The event should have decrypted");
    assert_eq!(decrypted.content, json!({"body": "hello bob"}));
    assert_eq!(events[0].room_id, room_id);
}

#[tokio::test]
async fn duplicate_timeline_events_are_delivered_once() {
    let (bob_user, bob_device) = bob_id();
    let bob = machine(bob_user, bob_device).await;

    let event = json!({
        "event_id": "$same-event",
        "sender": "@alice:localhost",
        "type": "m.room.message",
        "content": {"body": "hi"},
    });

    let make_response = |batch: &str| -> SyncResponse {
        serde_json::from_value(json!({
            "next_batch": batch,
            "rooms": {"join": {"!room:localhost": {"timeline": {"events": [event]}}}}
        }))
        .unwrap()
    };

    let transport = Arc::new(MockTransport::default());
    transport.sync_responses.lock().unwrap().push_back(make_response("batch-1"));
    transport.sync_responses.lock().unwrap().push_back(make_response("batch-2"));

    let handler = Arc::new(RecordingHandler::default());
    let service = service(transport, bob, handler.clone());

    service.sync_once().await.unwrap();
    service.sync_once().await.unwrap();

    assert_eq!(
        handler.room_events.lock().unwrap().len(),
        1,
        "The re-delivered event must be dropped by the dedup layer"
    );
}

#[tokio::test]
async fn invites_are_surfaced() {
    let (bob_user, bob_device) = bob_id();
    let bob = machine(bob_user, bob_device).await;

    let response: SyncResponse = serde_json::from_value(json!({
        "next_batch": "batch-1",
        "rooms": {"invite": {"!invited:localhost": {}}}
    }))
    .unwrap();

    let transport = Arc::new(MockTransport::default());
    transport.sync_responses.lock().unwrap().push_back(response);

    let handler = Arc::new(RecordingHandler::default());
    let service = service(transport, bob, handler.clone());

    service.sync_once().await.unwrap();

    assert_eq!(handler.invites.lock().unwrap().as_slice(), [room_id!("!invited:localhost")]);
}

#[tokio::test]
async fn shutdown_interrupts_an_in_flight_sync() {
    let (bob_user, bob_device) = bob_id();
    let bob = machine(bob_user, bob_device).await;

    // No scripted responses: the mock sync hangs like a real long poll.
    let transport = Arc::new(MockTransport::default());
    let handler = Arc::new(RecordingHandler::default());
    let service = Arc::new(service(transport, bob, handler));

    let (stop, shutdown) = shutdown_channel();

    let service_task = service.clone();
    let task = tokio::spawn(async move { service_task.run(shutdown).await });

    // Let the loop enter the long poll, then shut down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("The sync loop must stop promptly on shutdown")
        .unwrap();
}

#[tokio::test]
async fn low_key_counts_trigger_a_reupload() {
    let (bob_user, bob_device) = bob_id();
    let bob = machine(bob_user, bob_device).await;

    // Get the initial upload out of the way.
    let initial = bob.keys_for_upload().await.unwrap();
    bob.receive_keys_upload_response(&KeysUploadResponse {
        one_time_key_counts: [(
            "signed_curve25519".to_owned(),
            initial.one_time_keys.len() as u64,
        )]
        .into(),
    })
    .await
    .unwrap();
    assert!(bob.keys_for_upload().await.is_none());

    // The server reports a nearly drained key pool.
    let response: SyncResponse = serde_json::from_value(json!({
        "next_batch": "batch-1",
        "device_one_time_keys_count": {"signed_curve25519": 2},
    }))
    .unwrap();

    let transport = Arc::new(MockTransport::default());
    transport.sync_responses.lock().unwrap().push_back(response);

    let handler = Arc::new(RecordingHandler::default());
    let service = service(transport.clone(), bob, handler);

    service.sync_once().await.unwrap();

    assert!(
        service.machine().keys_for_upload().await.is_none(),
        "The replenished keys should have been uploaded within the same iteration"
    );
}

#[tokio::test]
async fn auto_setup_establishes_sessions_and_verifies_own_devices() {
    use cinnabar_client::AutoSetup;

    let (alice_user, alice_device) = alice_id();
    let second_device = device_id!("SECONDDEV");

    let alice = machine(alice_user, alice_device).await;
    // A second login of the same account, living on its own store.
    let other = machine(alice_user, second_device).await;
    let other_keys = other.keys_for_upload().await.unwrap();

    let transport = Arc::new(MockTransport::default());
    *transport.devices.lock().unwrap() = vec![
        OwnDevice { device_id: alice_device.to_owned(), display_name: None, last_seen_ts: None },
        OwnDevice { device_id: second_device.to_owned(), display_name: None, last_seen_ts: None },
    ];
    *transport.query_response.lock().unwrap() = KeysQueryResponse {
        device_keys: [(
            alice_user.to_owned(),
            HashMap::from([(
                second_device.to_owned(),
                other_keys.device_keys.clone().unwrap(),
            )]),
        )]
        .into(),
        ..Default::default()
    };

    let (key_id, key) = other_keys.one_time_keys.iter().next().unwrap();
    *transport.claim_response.lock().unwrap() = KeysClaimResponse {
        one_time_keys: [(
            alice_user.to_owned(),
            [(second_device.to_owned(), [(key_id.clone(), key.clone())].into())].into(),
        )]
        .into(),
        ..Default::default()
    };

    let setup = AutoSetup::new(transport, alice.clone());
    let summary = setup.run().await.unwrap();

    assert_eq!(summary.sessions_created, 1);
    assert_eq!(summary.devices_verified, 1);
    assert_eq!(summary.devices_skipped, 0);

    let device = alice
        .store()
        .get_device(alice_user, second_device)
        .await
        .unwrap()
        .expect("The second device should be in the store after the setup");
    assert!(device.is_verified());

    // A second run is a no-op: the session exists and the device is
    // already trusted.
    let setup = AutoSetup::new(Arc::new(MockTransport::default()), alice);
    let summary = setup.run().await.unwrap();
    assert_eq!(summary.sessions_created, 0);
    assert_eq!(summary.devices_verified, 0);
}

#[tokio::test]
async fn backup_round_trip_through_the_mock_server() {
    use cinnabar_client::BackupRecovery;

    let (alice_user, alice_device) = alice_id();
    let room_id = room_id!("!room:localhost");

    let alice = machine(alice_user, alice_device).await;
    alice.share_room_key(room_id, [alice_user], Default::default()).await.unwrap();

    let transport = Arc::new(MockTransport::default());

    // Alice creates the backup and uploads her room key.
    let recovery = BackupRecovery::new(transport.clone(), alice);
    let (key, version) = recovery.create().await.unwrap();
    let uploaded = recovery.upload_pending().await.unwrap();
    assert_eq!(uploaded, 1);

    // A new login restores from the same backup using the displayed
    // recovery key.
    let new_login = machine(alice_user, device_id!("NEWDEVICE")).await;
    let recovery = BackupRecovery::new(transport, new_login.clone());

    let (restored_key, found_version) = recovery.open(&key.to_string()).await.unwrap();
    assert_eq!(found_version.version, version);

    let result = recovery.restore(&restored_key, &found_version.version).await.unwrap();
    assert_eq!(result.imported_count, 1);

    // The wrong key must fail the public-key check and restore nothing.
    let wrong = cinnabar_crypto::backups::BackupDecryptionKey::new();
    let error = recovery.open(&wrong.to_base64()).await;
    assert!(matches!(error, Err(cinnabar_client::RecoveryError::KeyMismatch)));
}
