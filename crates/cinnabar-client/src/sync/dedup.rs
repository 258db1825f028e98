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

//! Duplicate suppression for timeline events.
//!
//! Servers occasionally re-deliver events across sync boundaries. Events
//! with an id go through a bounded seen-set with FIFO eviction; events
//! without one fall back to a content fingerprint indexed by the event's
//! position in the batch, re-aligned on every sync.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// How many event ids the seen-set holds before the oldest are evicted.
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
    /// Position in the last batch → content fingerprint, for id-less events.
    fingerprints: HashMap<usize, u64>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
            fingerprints: HashMap::new(),
        }
    }

    /// Check whether the event at `position` of the current batch was seen
    /// before, recording it either way.
    pub fn is_duplicate(&mut self, position: usize, event: &Value) -> bool {
        match event.get("event_id").and_then(Value::as_str) {
            Some(event_id) => self.check_id(event_id),
            None => self.check_fingerprint(position, event),
        }
    }

    /// Drop fingerprint entries for positions that no longer exist in the
    /// new batch. Must be called once per sync before processing events.
    pub fn align(&mut self, batch_len: usize) {
        self.fingerprints.retain(|position, _| *position < batch_len);
    }

    fn check_id(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return true;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(event_id.to_owned());
        self.order.push_back(event_id.to_owned());

        false
    }

    fn check_fingerprint(&mut self, position: usize, event: &Value) -> bool {
        let fingerprint = Self::fingerprint(event);

        if self.fingerprints.get(&position) == Some(&fingerprint) {
            return true;
        }

        self.fingerprints.insert(position, fingerprint);

        false
    }

    /// A stable hash over the identifying parts of an event.
    fn fingerprint(event: &Value) -> u64 {
        let normalized = serde_json::json!({
            "sender": event.get("sender"),
            "type": event.get("type"),
            "content": event.get("content"),
            "origin_server_ts": event.get("origin_server_ts"),
        });

        let digest = Sha256::digest(
            serde_json::to_vec(&normalized).expect("A JSON value can always be serialized"),
        );

        u64::from_be_bytes(digest[..8].try_into().expect("A SHA-256 digest has 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Deduplicator;

    #[test]
    fn repeated_event_ids_are_duplicates() {
        let mut dedup = Deduplicator::new(10);

        let event = json!({"event_id": "$one", "type": "m.room.message"});

        assert!(!dedup.is_duplicate(0, &event));
        assert!(dedup.is_duplicate(0, &event));
        assert!(dedup.is_duplicate(3, &event), "The position doesn't matter for id'd events");
    }

    #[test]
    fn eviction_is_fifo_and_bounded() {
        let mut dedup = Deduplicator::new(2);

        let a = json!({"event_id": "$a"});
        let b = json!({"event_id": "$b"});
        let c = json!({"event_id": "$c"});

        assert!(!dedup.is_duplicate(0, &a));
        assert!(!dedup.is_duplicate(1, &b));
        // $a is evicted by $c.
        assert!(!dedup.is_duplicate(2, &c));
        assert!(!dedup.is_duplicate(3, &a));
        // $b was evicted when $a came back in.
        assert!(!dedup.is_duplicate(4, &b));
    }

    #[test]
    fn id_less_events_deduplicate_by_position_and_content() {
        let mut dedup = Deduplicator::new(10);

        let event = json!({"sender": "@a:hs", "type": "m.x", "content": {"body": "hi"}});
        let other = json!({"sender": "@a:hs", "type": "m.x", "content": {"body": "yo"}});

        assert!(!dedup.is_duplicate(0, &event));
        assert!(dedup.is_duplicate(0, &event));

        // Different content at the same position is fresh.
        assert!(!dedup.is_duplicate(0, &other));

        // Same content at a different position is fresh too.
        assert!(!dedup.is_duplicate(1, &event));
    }

    #[test]
    fn align_drops_stale_positions() {
        let mut dedup = Deduplicator::new(10);
        let event = json!({"sender": "@a:hs", "type": "m.x", "content": {}});

        assert!(!dedup.is_duplicate(5, &event));

        // The next sync only has two timeline entries.
        dedup.align(2);
        assert!(!dedup.is_duplicate(5, &event));
    }
}
