use serde::{Deserialize, Serialize};

/// Memory-distance classes for reading a scan-range replica, cheapest first.
///
/// Doubles as the `replica_preference` query option: the chosen value acts as
/// a floor on the distance every replica is treated at, so `DiskLocal` makes
/// cached replicas look like plain local disk and `Remote` disables locality
/// entirely.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPreference {
    /// Replica resident in the storage layer's cache on a local executor.
    CacheLocal,
    /// Replica on local disk of an executor host.
    DiskLocal,
    /// Replica only reachable over the network.
    Remote,
}

impl Default for ReplicaPreference {
    fn default() -> Self {
        Self::CacheLocal
    }
}

/// Per-query options that influence scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryOptions {
    /// Minimum memory distance applied to every replica.
    #[serde(default)]
    pub replica_preference: ReplicaPreference,
    /// Break ties between equivalent disk-local replicas randomly instead of
    /// deterministically by replica order.
    #[serde(default)]
    pub schedule_random_replica: bool,
    /// Treat cached replicas as disk-local. Takes precedence over
    /// `replica_preference` and any per-node hint.
    #[serde(default)]
    pub disable_cached_reads: bool,
    /// Maximum number of instances per host for scan-driven fragments.
    #[serde(default = "default_mt_dop")]
    pub mt_dop: u32,
    /// Requested admission pool. Opaque to the scheduler; empty means the
    /// resolver picks the default pool.
    #[serde(default)]
    pub request_pool: String,
}

fn default_mt_dop() -> u32 {
    1
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            replica_preference: ReplicaPreference::default(),
            schedule_random_replica: false,
            disable_cached_reads: false,
            mt_dop: default_mt_dop(),
            request_pool: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReplicaPreference;

    #[test]
    fn memory_distance_orders_cheapest_first() {
        assert!(ReplicaPreference::CacheLocal < ReplicaPreference::DiskLocal);
        assert!(ReplicaPreference::DiskLocal < ReplicaPreference::Remote);
    }
}
