//! Statestore-driven cluster membership tracking.
//!
//! Contract:
//! - topic deltas apply copy-on-write; a new snapshot is published by atomic
//!   pointer swap and readers keep whatever snapshot they already loaded;
//! - full-map deltas replace the entire membership table, incremental deltas
//!   insert/replace/remove individual entries;
//! - malformed payloads are logged and skipped, the tracker never aborts;
//! - only executor backends enter the published snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use quarry_common::metrics::global_metrics;
use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend_config::{BackendConfig, BackendDescriptor};

/// Statestore topic carrying backend registrations.
pub const CLUSTER_MEMBERSHIP_TOPIC: &str = "cluster-membership";

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One entry of a membership topic delta. An absent payload is a tombstone.
pub struct TopicEntry {
    /// Statestore key identifying the backend registration.
    pub key: String,
    /// JSON-encoded [`BackendDescriptor`], or `None` to remove the key.
    pub payload: Option<Vec<u8>>,
}

impl TopicEntry {
    /// Entry announcing (or re-announcing) a backend.
    pub fn update(key: impl Into<String>, descriptor: &BackendDescriptor) -> Self {
        Self {
            key: key.into(),
            payload: Some(encode_backend_descriptor(descriptor)),
        }
    }

    /// Tombstone removing a previous registration.
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A batch of membership updates from the statestore.
pub struct TopicDelta {
    /// Topic the entries belong to.
    pub topic_name: String,
    /// `true` for an incremental update, `false` for a full map that replaces
    /// the whole membership table.
    pub is_delta: bool,
    /// Updates and tombstones, in arrival order.
    pub entries: Vec<TopicEntry>,
}

impl TopicDelta {
    /// Full-map delta replacing the entire membership table.
    pub fn full(entries: Vec<TopicEntry>) -> Self {
        Self {
            topic_name: CLUSTER_MEMBERSHIP_TOPIC.to_string(),
            is_delta: false,
            entries,
        }
    }

    /// Incremental delta applied on top of the current table.
    pub fn incremental(entries: Vec<TopicEntry>) -> Self {
        Self {
            topic_name: CLUSTER_MEMBERSHIP_TOPIC.to_string(),
            is_delta: true,
            entries,
        }
    }
}

/// Serialize a descriptor into the topic payload format.
pub fn encode_backend_descriptor(descriptor: &BackendDescriptor) -> Vec<u8> {
    // Descriptors are a handful of small fields; encoding cannot fail.
    serde_json::to_vec(descriptor).unwrap_or_default()
}

/// Decode a topic payload. Unknown fields are ignored.
pub fn decode_backend_descriptor(payload: &[u8]) -> Result<BackendDescriptor> {
    serde_json::from_slice(payload).map_err(|e| QuarryError::MembershipDecode(e.to_string()))
}

/// Tracks cluster membership and publishes immutable [`BackendConfig`]
/// snapshots.
///
/// Deltas are expected to arrive on a single subscriber thread; the internal
/// mutex only guards against misuse, it is never contended on the read path.
/// Readers call [`MembershipTracker::snapshot`] once per scheduling pass and
/// hold the returned `Arc` until they are done.
#[derive(Debug)]
pub struct MembershipTracker {
    current_membership: Mutex<HashMap<String, BackendDescriptor>>,
    published: ArcSwap<BackendConfig>,
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipTracker {
    /// Tracker with an empty snapshot; backends arrive via topic deltas.
    pub fn new() -> Self {
        Self {
            current_membership: Mutex::new(HashMap::new()),
            published: ArcSwap::from_pointee(BackendConfig::new()),
        }
    }

    /// Tracker seeded with a fixed backend list (static cluster mode). The
    /// snapshot still updates if deltas are applied later.
    pub fn with_static_backends(backends: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let tracker = Self::new();
        let entries = backends
            .into_iter()
            .map(|be| TopicEntry::update(be.address.to_string(), &be))
            .collect();
        tracker.apply_delta(&TopicDelta::full(entries));
        tracker
    }

    /// Current published snapshot. The returned `Arc` stays valid across
    /// concurrent membership updates.
    pub fn snapshot(&self) -> Arc<BackendConfig> {
        self.published.load_full()
    }

    /// Apply one topic delta and publish a new snapshot.
    ///
    /// An empty incremental delta leaves the published snapshot untouched.
    /// Re-registrations of the same `host:port` under a different statestore
    /// key drop the stale entry (last writer wins).
    pub fn apply_delta(&self, delta: &TopicDelta) {
        let mut membership = match self.current_membership.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if delta.is_delta && delta.entries.is_empty() {
            return;
        }
        if !delta.is_delta {
            membership.clear();
        }

        for entry in &delta.entries {
            match &entry.payload {
                None => {
                    membership.remove(&entry.key);
                }
                Some(payload) => match decode_backend_descriptor(payload) {
                    Ok(descriptor) => {
                        let stale_keys: Vec<String> = membership
                            .iter()
                            .filter(|(key, existing)| {
                                **key != entry.key && existing.address == descriptor.address
                            })
                            .map(|(key, _)| key.clone())
                            .collect();
                        for key in stale_keys {
                            warn!(
                                stale_key = %key,
                                new_key = %entry.key,
                                address = %descriptor.address,
                                "duplicate backend registration, dropping stale entry"
                            );
                            membership.remove(&key);
                        }
                        membership.insert(entry.key.clone(), descriptor);
                    }
                    Err(e) => {
                        warn!(
                            key = %entry.key,
                            error = %e,
                            "skipping malformed membership entry"
                        );
                    }
                },
            }
        }

        // Rebuild from sorted keys so hostname resolution is stable across
        // rebuilds of identical membership content.
        let mut keys: Vec<&String> = membership.keys().collect();
        keys.sort_unstable();
        let mut config = BackendConfig::new();
        for key in keys {
            let descriptor = &membership[key];
            if descriptor.is_executor {
                config.add_backend(descriptor.clone());
            }
        }

        global_metrics().set_membership_backends(membership.len() as i64);
        global_metrics().set_membership_executors(config.num_backends() as i64);
        info!(
            backends = membership.len(),
            executors = config.num_backends(),
            full_map = !delta.is_delta,
            "cluster membership updated"
        );
        self.published.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::{MembershipTracker, TopicDelta, TopicEntry};
    use crate::backend_config::{BackendDescriptor, NetworkAddress};
    use std::sync::Arc;

    fn descriptor(hostname: &str, ip: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor::new(NetworkAddress::new(hostname, port), ip)
    }

    fn update(key: &str, descriptor: &BackendDescriptor) -> TopicEntry {
        TopicEntry::update(key, descriptor)
    }

    #[test]
    fn full_map_replaces_membership() {
        let tracker = MembershipTracker::new();
        tracker.apply_delta(&TopicDelta::full(vec![
            update("be1", &descriptor("host_1", "10.0.0.1", 1001)),
            update("be2", &descriptor("host_2", "10.0.0.2", 1001)),
        ]));
        assert_eq!(tracker.snapshot().num_backends(), 2);

        tracker.apply_delta(&TopicDelta::full(vec![update(
            "be3",
            &descriptor("host_3", "10.0.0.3", 1001),
        )]));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.num_backends(), 1);
        assert!(snapshot.lookup_backend_ip("host_1").is_none());
    }

    #[test]
    fn incremental_delta_inserts_and_removes() {
        let tracker = MembershipTracker::new();
        tracker.apply_delta(&TopicDelta::incremental(vec![
            update("be1", &descriptor("host_1", "10.0.0.1", 1001)),
            update("be2", &descriptor("host_2", "10.0.0.2", 1001)),
        ]));
        tracker.apply_delta(&TopicDelta::incremental(vec![TopicEntry::tombstone("be1")]));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.num_backends(), 1);
        assert!(snapshot.lookup_backend_ip("host_2").is_some());
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let tracker = MembershipTracker::new();
        tracker.apply_delta(&TopicDelta::incremental(vec![
            update("be1", &descriptor("host_1", "10.0.0.1", 1001)),
            TopicEntry {
                key: "be2".to_string(),
                payload: Some(b"not json".to_vec()),
            },
        ]));
        assert_eq!(tracker.snapshot().num_backends(), 1);
    }

    #[test]
    fn duplicate_registration_last_writer_wins() {
        let tracker = MembershipTracker::new();
        let be = descriptor("host_1", "10.0.0.1", 1001);
        tracker.apply_delta(&TopicDelta::incremental(vec![update("old-id", &be)]));
        tracker.apply_delta(&TopicDelta::incremental(vec![update("new-id", &be)]));
        assert_eq!(tracker.snapshot().num_backends(), 1);

        // Removing the old key must not drop the surviving registration.
        tracker.apply_delta(&TopicDelta::incremental(vec![TopicEntry::tombstone(
            "old-id",
        )]));
        assert_eq!(tracker.snapshot().num_backends(), 1);
    }

    #[test]
    fn empty_incremental_delta_keeps_published_snapshot() {
        let tracker = MembershipTracker::new();
        tracker.apply_delta(&TopicDelta::incremental(vec![update(
            "be1",
            &descriptor("host_1", "10.0.0.1", 1001),
        )]));
        let before = tracker.snapshot();
        tracker.apply_delta(&TopicDelta::incremental(vec![]));
        let after = tracker.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn full_map_resync_yields_equal_snapshot() {
        let tracker = MembershipTracker::new();
        let entries = vec![
            update("be1", &descriptor("host_1", "10.0.0.1", 1001)),
            update("be2", &descriptor("host_2", "10.0.0.2", 1001)),
        ];
        tracker.apply_delta(&TopicDelta::full(entries.clone()));
        let before = tracker.snapshot();
        tracker.apply_delta(&TopicDelta::full(entries));
        let after = tracker.snapshot();
        assert_eq!(*before, *after);
    }

    #[test]
    fn coordinator_only_backends_stay_out_of_snapshot() {
        let tracker = MembershipTracker::new();
        let mut coord = descriptor("host_1", "10.0.0.1", 1001);
        coord.is_executor = false;
        tracker.apply_delta(&TopicDelta::incremental(vec![
            update("coord", &coord),
            update("exec", &descriptor("host_2", "10.0.0.2", 1001)),
        ]));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.num_backends(), 1);
        assert!(snapshot.lookup_backend_ip("host_1").is_none());
    }

    #[test]
    fn old_snapshot_survives_membership_swap() {
        let tracker = MembershipTracker::new();
        tracker.apply_delta(&TopicDelta::full(vec![
            update("be1", &descriptor("host_1", "10.0.0.1", 1001)),
            update("be2", &descriptor("host_2", "10.0.0.2", 1001)),
        ]));
        let held = tracker.snapshot();
        tracker.apply_delta(&TopicDelta::incremental(vec![TopicEntry::tombstone("be2")]));
        assert_eq!(held.num_backends(), 2);
        assert_eq!(tracker.snapshot().num_backends(), 1);
    }
}
