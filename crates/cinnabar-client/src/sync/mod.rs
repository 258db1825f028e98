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

//! The long-poll sync loop and event dispatcher.
//!
//! Each iteration requests the next batch with the stored cursor and then
//! dispatches in a fixed order: device-list deltas, one-time-key counts,
//! to-device events, and finally room timelines and invites. Transient
//! errors back off and retry forever; cancellation is observed at the top
//! of every iteration and during the backoff, so shutdown waits for at
//! most one in-flight request.

mod dedup;
mod response;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use cinnabar_crypto::{
    types::events::MegolmEncryptedContent, DecryptedRoomEvent, MegolmError, OlmMachine,
    ProcessedToDeviceEvent, SyncChanges,
};
use ruma::{OwnedRoomId, RoomId};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

pub use dedup::Deduplicator;
pub use response::{JoinedRoom, Rooms, SyncResponse, Timeline, ToDevice};

use crate::{error::ClientError, transport::HomeserverTransport};

/// Configuration of the sync loop.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// The long-poll timeout passed to the server.
    pub timeout: Duration,
    /// How long to wait before retrying after a failed sync.
    pub backoff: Duration,
    /// Where to persist the sync cursor, so a restart resumes instead of
    /// replaying history.
    pub token_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff: Duration::from_secs(5),
            token_path: None,
        }
    }
}

/// A timeline event as surfaced to the message layer.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// The room the event belongs to.
    pub room_id: OwnedRoomId,
    /// The raw event.
    pub raw: Value,
    /// The decrypted payload, when the event was encrypted and the room
    /// key was available.
    pub decrypted: Option<DecryptedRoomEvent>,
}

/// The callbacks the sync loop feeds events into.
///
/// This is the boundary to the message layer; everything security-critical
/// happened before these are called.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// A timeline event arrived in a joined room.
    async fn on_room_event(&self, event: TimelineEvent);

    /// An invite arrived.
    async fn on_invite(&self, room_id: &RoomId) {
        trace!(?room_id, "Ignoring an invite, no handler installed");
    }

    /// A decrypted to-device event that the crypto engine didn't consume.
    async fn on_to_device(&self, event: ProcessedToDeviceEvent) {
        trace!(event_type = event.event_type, "Ignoring an unhandled to-device event");
    }
}

/// The sync loop driving an [`OlmMachine`].
pub struct SyncService {
    transport: Arc<dyn HomeserverTransport>,
    machine: OlmMachine,
    handler: Arc<dyn SyncHandler>,
    settings: SyncSettings,
    token: StdMutex<Option<String>>,
    dedups: StdMutex<HashMap<OwnedRoomId, Deduplicator>>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("settings", &self.settings)
            .field("token", &self.token.lock().unwrap())
            .finish()
    }
}

impl SyncService {
    /// Create a sync service; the cursor is restored from
    /// [`SyncSettings::token_path`] when one is configured.
    pub fn new(
        transport: Arc<dyn HomeserverTransport>,
        machine: OlmMachine,
        handler: Arc<dyn SyncHandler>,
        settings: SyncSettings,
    ) -> Self {
        let token = settings
            .token_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty());

        if let Some(token) = &token {
            info!(token = &token[..token.len().min(12)], "Restored the sync cursor");
        }

        Self {
            transport,
            machine,
            handler,
            settings,
            token: StdMutex::new(token),
            dedups: StdMutex::new(HashMap::new()),
        }
    }

    /// The machine this service drives.
    pub fn machine(&self) -> &OlmMachine {
        &self.machine
    }

    /// The current sync cursor.
    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn set_token(&self, token: String) {
        if let Some(path) = &self.settings.token_path {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, &token)
                .and_then(|_| std::fs::rename(&tmp, path))
                .is_err()
            {
                warn!(path = %path.display(), "Failed to persist the sync cursor");
            }
        }

        *self.token.lock().unwrap() = Some(token);
    }

    /// Run the sync loop until `shutdown` fires.
    ///
    /// The loop never terminates on its own; network and homeserver
    /// failures are retried after a fixed backoff, indefinitely.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting the sync loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let since = self.token();
            let request = self.transport.sync(since, self.settings.timeout);
            tokio::pin!(request);

            let response = tokio::select! {
                _ = shutdown.changed() => break,
                response = &mut request => response,
            };

            match response {
                Ok(response) => {
                    self.set_token(response.next_batch.clone());

                    if let Err(e) = self.process_response(response).await {
                        warn!(error = %e, "Failed to process a sync response");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "The sync request failed, backing off");

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.settings.backoff) => {}
                    }
                }
            }
        }

        info!("The sync loop stopped");
    }

    /// Run a single sync iteration. Mostly useful for tests and tools that
    /// drive the loop themselves.
    pub async fn sync_once(&self) -> Result<(), ClientError> {
        let response = self.transport.sync(self.token(), self.settings.timeout).await?;
        self.set_token(response.next_batch.clone());
        self.process_response(response).await
    }

    /// Dispatch one sync response in the fixed order.
    #[instrument(skip_all)]
    async fn process_response(&self, response: SyncResponse) -> Result<(), ClientError> {
        // (a) + (b) + (c): device lists, key counts, to-device routing.
        let processed = self
            .machine
            .receive_sync_changes(SyncChanges {
                to_device_events: response.to_device.events,
                device_lists: response.device_lists,
                one_time_key_counts: response.device_one_time_keys_count,
            })
            .await?;

        for event in processed {
            self.handler.on_to_device(event).await;
        }

        // Anything the engine queued in response (key uploads, verification
        // traffic) goes out before the room events are surfaced.
        self.send_outgoing_requests().await;

        // (d) Room timelines and invites.
        for (room_id, room) in response.rooms.join {
            self.process_timeline(&room_id, room.timeline).await;
        }

        for room_id in response.rooms.invite.keys() {
            self.handler.on_invite(room_id).await;
        }

        // Key requests queued by failed decryptions.
        self.send_outgoing_requests().await;

        Ok(())
    }

    async fn process_timeline(&self, room_id: &RoomId, timeline: Timeline) {
        {
            let mut dedups = self.dedups.lock().unwrap();
            dedups.entry(room_id.to_owned()).or_default().align(timeline.events.len());
        }

        for (position, event) in timeline.events.into_iter().enumerate() {
            let duplicate = self
                .dedups
                .lock()
                .unwrap()
                .get_mut(room_id)
                .map(|d| d.is_duplicate(position, &event))
                .unwrap_or(false);

            if duplicate {
                trace!(?room_id, position, "Skipping a duplicate timeline event");
                continue;
            }

            let decrypted = self.try_decrypt(room_id, &event).await;

            self.handler
                .on_room_event(TimelineEvent {
                    room_id: room_id.to_owned(),
                    raw: event,
                    decrypted,
                })
                .await;
        }
    }

    async fn try_decrypt(&self, room_id: &RoomId, event: &Value) -> Option<DecryptedRoomEvent> {
        if event.get("type").and_then(Value::as_str) != Some("m.room.encrypted") {
            return None;
        }

        let content: MegolmEncryptedContent =
            match serde_json::from_value(event.get("content")?.clone()) {
                Ok(content) => content,
                Err(e) => {
                    warn!(?room_id, error = %e, "An encrypted event has malformed content");
                    return None;
                }
            };

        match self.machine.decrypt_room_event(room_id, &content).await {
            Ok(decrypted) => Some(decrypted),
            Err(MegolmError::MissingRoomKey) => {
                // The machine queued a room key request; surface the event
                // undecrypted so the message layer can show a placeholder.
                debug!(?room_id, session_id = content.session_id, "Missing the room key");
                None
            }
            Err(e) => {
                warn!(?room_id, error = %e, "Failed to decrypt a room event");
                None
            }
        }
    }

    /// Send everything the machine wants to send, routing the responses
    /// back into it.
    ///
    /// Transport failures are logged and dropped; the affected request is
    /// regenerated by the machine on a later iteration.
    pub async fn send_outgoing_requests(&self) {
        use cinnabar_crypto::requests::AnyOutgoingRequest;

        let requests = match self.machine.outgoing_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Failed to collect the outgoing requests");
                return;
            }
        };

        for request in requests {
            let result: Result<(), ClientError> = async {
                match &request.request {
                    AnyOutgoingRequest::KeysUpload(upload) => {
                        let response = self.transport.keys_upload(upload).await?;
                        self.machine.receive_keys_upload_response(&response).await?;
                    }
                    AnyOutgoingRequest::KeysQuery(query) => {
                        let response = self.transport.keys_query(query).await?;
                        self.machine.receive_keys_query_response(&response).await?;
                    }
                    AnyOutgoingRequest::KeysClaim(claim) => {
                        let response = self.transport.keys_claim(claim).await?;
                        self.machine.receive_keys_claim_response(&response).await?;
                    }
                    AnyOutgoingRequest::ToDevice(to_device) => {
                        self.transport.send_to_device(to_device).await?;
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = result {
                warn!(
                    request_id = request.request_id.as_str(),
                    error = %e,
                    "Failed to send an outgoing request"
                );
            }
        }
    }
}

/// Create a watch channel pair for shutting down a [`SyncService::run`]
/// call. Send `true` (or drop the sender) to stop the loop.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
