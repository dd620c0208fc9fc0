//! Scan-range assignment: memory-distance classification, load tracking, and
//! executor selection.
//!
//! Contract:
//! - every scan range of a node is assigned to exactly one backend of the
//!   snapshot the assignment context was built over;
//! - ranges with at least one replica on an executor host are placed before
//!   purely remote ranges, so remote work load-balances over the remainder;
//! - selection is deterministic given (snapshot, ranges, RNG state).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use quarry_common::metrics::global_metrics;
use quarry_common::{PlanNodeId, QuarryError, QueryOptions, ReplicaPreference, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend_config::{BackendConfig, BackendDescriptor, IpAddr, NetworkAddress};
use crate::plan::{ScanRange, ScanRangeLocations};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A scan range as handed to one executor, with read-path flags resolved.
pub struct ScanRangeParams {
    /// The range to read.
    pub scan_range: ScanRange,
    /// Whether the read is served from the storage layer's cache.
    pub is_cached: bool,
    /// Whether the executor reads the data over the network.
    pub is_remote: bool,
}

/// Scan ranges of one executor, grouped by scan node.
pub type PerNodeScanRanges = BTreeMap<PlanNodeId, Vec<ScanRangeParams>>;

/// Assignment of scan ranges to executor addresses for one fragment.
///
/// Ordered so fragment-instance creation iterates hosts deterministically.
pub type FragmentScanRangeAssignment = BTreeMap<NetworkAddress, PerNodeScanRanges>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Bytes assigned per read path during one node's assignment.
pub struct AssignmentByteCounters {
    /// Bytes read by an executor collocated with a replica.
    pub local_bytes: i64,
    /// Subset of `local_bytes` served from cache.
    pub cached_bytes: i64,
    /// Bytes read over the network.
    pub remote_bytes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Outcome counters of one node's scan-range assignment.
pub struct NodeAssignmentStats {
    /// Total ranges assigned.
    pub num_assignments: u64,
    /// Ranges with a replica local to the chosen executor.
    pub num_local_assignments: u64,
    /// Ranges read remotely.
    pub num_remote_assignments: u64,
    /// Byte counters per read path.
    pub byte_counters: AssignmentByteCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    // Field order is the sort key: (assigned_bytes, random_rank, ip).
    assigned_bytes: i64,
    random_rank: usize,
    ip: IpAddr,
}

/// Min-set of backends ordered by `(assigned_bytes, random_rank)` with
/// O(log n) update-by-IP through a side map.
///
/// Ties on assigned bytes break by a per-context random rank so equally
/// loaded backends are picked in a different order by every plan node.
#[derive(Debug, Default)]
pub struct AddressableAssignmentHeap {
    ordered: BTreeSet<HeapEntry>,
    by_ip: HashMap<IpAddr, (i64, usize)>,
}

impl AddressableAssignmentHeap {
    /// Add `bytes_delta` to the backend's key, inserting it first if absent.
    /// Only increase operations are needed; keys never shrink.
    pub fn insert_or_update(&mut self, ip: &IpAddr, bytes_delta: i64, rank: usize) {
        match self.by_ip.get_mut(ip) {
            Some((assigned_bytes, existing_rank)) => {
                let removed = self.ordered.remove(&HeapEntry {
                    assigned_bytes: *assigned_bytes,
                    random_rank: *existing_rank,
                    ip: ip.clone(),
                });
                debug_assert!(removed);
                *assigned_bytes += bytes_delta;
                self.ordered.insert(HeapEntry {
                    assigned_bytes: *assigned_bytes,
                    random_rank: *existing_rank,
                    ip: ip.clone(),
                });
            }
            None => {
                self.by_ip.insert(ip.clone(), (bytes_delta, rank));
                self.ordered.insert(HeapEntry {
                    assigned_bytes: bytes_delta,
                    random_rank: rank,
                    ip: ip.clone(),
                });
            }
        }
    }

    /// Bytes currently assigned to the backend, if it has any.
    pub fn assigned_bytes(&self, ip: &str) -> Option<i64> {
        self.by_ip.get(ip).map(|(bytes, _)| *bytes)
    }

    /// IP of the least-loaded backend.
    pub fn top(&self) -> Option<&IpAddr> {
        self.ordered.first().map(|e| &e.ip)
    }

    /// Number of backends in the heap.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the heap holds no backends.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Per-plan-node scheduling state: the assignment heap, a random backend
/// permutation with per-backend ranks, round-robin cursors for hosts with
/// multiple backends, and byte counters.
///
/// One context is created per scan node and never shared across threads.
pub struct AssignmentCtx<'a> {
    backend_config: &'a BackendConfig,
    assignment_heap: AddressableAssignmentHeap,
    random_backend_rank: HashMap<IpAddr, usize>,
    random_backend_order: Vec<IpAddr>,
    first_unused_backend_idx: usize,
    next_backend_per_host: HashMap<IpAddr, usize>,
    byte_counters: AssignmentByteCounters,
    num_assignments: u64,
    num_local_assignments: u64,
    num_remote_assignments: u64,
}

impl<'a> AssignmentCtx<'a> {
    /// Build a context over a snapshot, drawing the backend permutation from
    /// the injected RNG.
    pub fn new<R: Rng + ?Sized>(backend_config: &'a BackendConfig, rng: &mut R) -> Self {
        let mut random_backend_order = backend_config.all_backend_ips();
        random_backend_order.shuffle(rng);
        let random_backend_rank = random_backend_order
            .iter()
            .enumerate()
            .map(|(rank, ip)| (ip.clone(), rank))
            .collect();
        Self {
            backend_config,
            assignment_heap: AddressableAssignmentHeap::default(),
            random_backend_rank,
            random_backend_order,
            first_unused_backend_idx: 0,
            next_backend_per_host: HashMap::new(),
            byte_counters: AssignmentByteCounters::default(),
            num_assignments: 0,
            num_local_assignments: 0,
            num_remote_assignments: 0,
        }
    }

    /// Snapshot this context assigns against.
    pub fn backend_config(&self) -> &BackendConfig {
        self.backend_config
    }

    fn backend_rank(&self, ip: &str) -> usize {
        self.random_backend_rank.get(ip).copied().unwrap_or(usize::MAX)
    }

    fn has_unused_backends(&self) -> bool {
        self.first_unused_backend_idx < self.random_backend_order.len()
    }

    /// Among candidate IPs, pick the one with the minimum assigned bytes.
    /// Ties break by random rank when `break_ties_by_rank` is set, otherwise
    /// by candidate input order (which warms OS caches deterministically).
    pub fn select_local_backend_host(
        &self,
        data_locations: &[IpAddr],
        break_ties_by_rank: bool,
    ) -> Option<IpAddr> {
        let mut min_assigned_bytes = i64::MAX;
        let mut candidate_idxs: Vec<usize> = Vec::new();
        for (idx, ip) in data_locations.iter().enumerate() {
            let assigned_bytes = self.assignment_heap.assigned_bytes(ip).unwrap_or(0);
            if assigned_bytes < min_assigned_bytes {
                min_assigned_bytes = assigned_bytes;
                candidate_idxs.clear();
            }
            if assigned_bytes == min_assigned_bytes {
                candidate_idxs.push(idx);
            }
        }
        let chosen = if break_ties_by_rank {
            candidate_idxs
                .into_iter()
                .min_by_key(|&idx| self.backend_rank(&data_locations[idx]))
        } else {
            candidate_idxs.into_iter().next()
        };
        chosen.map(|idx| data_locations[idx].clone())
    }

    /// Pick a backend for a remote read: unused backends first (in random
    /// order), then the least-loaded backend from the heap.
    pub fn select_remote_backend_host(&mut self) -> Option<IpAddr> {
        if self.has_unused_backends() {
            let ip = self.random_backend_order[self.first_unused_backend_idx].clone();
            self.first_unused_backend_idx += 1;
            return Some(ip);
        }
        self.assignment_heap.top().cloned()
    }

    /// Round-robin over the backends listening on one IP.
    pub fn select_backend_on_host(&mut self, ip: &IpAddr) -> Result<BackendDescriptor> {
        let backends = self
            .backend_config
            .backends_on_host(ip)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| {
                QuarryError::Internal(format!("no backend registered on host {ip}"))
            })?;
        if backends.len() == 1 {
            return Ok(backends[0].clone());
        }
        let cursor = self.next_backend_per_host.entry(ip.clone()).or_insert(0);
        let backend = backends[*cursor].clone();
        *cursor = (*cursor + 1) % backends.len();
        Ok(backend)
    }

    /// Record one assignment: append to the per-node list for the backend,
    /// bump the heap key, and update byte counters and metrics.
    pub fn record_scan_range_assignment(
        &mut self,
        backend: &BackendDescriptor,
        node_id: PlanNodeId,
        scan_range_locations: &ScanRangeLocations,
        is_cached: bool,
        is_remote: bool,
        assignment: &mut FragmentScanRangeAssignment,
    ) {
        let scan_range_length = scan_range_locations.scan_range.length_bytes.max(0);
        let rank = self.backend_rank(&backend.ip_address);
        // Zero-length ranges still advance the heap key so one backend is not
        // preferred indefinitely.
        self.assignment_heap
            .insert_or_update(&backend.ip_address, scan_range_length.max(1), rank);

        if is_remote {
            self.byte_counters.remote_bytes += scan_range_length;
            self.num_remote_assignments += 1;
        } else {
            self.byte_counters.local_bytes += scan_range_length;
            if is_cached {
                self.byte_counters.cached_bytes += scan_range_length;
            }
            self.num_local_assignments += 1;
        }
        self.num_assignments += 1;
        global_metrics().inc_assignment(!is_remote);

        assignment
            .entry(backend.address.clone())
            .or_default()
            .entry(node_id)
            .or_default()
            .push(ScanRangeParams {
                scan_range: scan_range_locations.scan_range.clone(),
                is_cached,
                is_remote,
            });
    }

    fn stats(&self) -> NodeAssignmentStats {
        NodeAssignmentStats {
            num_assignments: self.num_assignments,
            num_local_assignments: self.num_local_assignments,
            num_remote_assignments: self.num_remote_assignments,
            byte_counters: self.byte_counters,
        }
    }
}

fn replica_memory_distance(is_cached: bool, base_distance: ReplicaPreference) -> ReplicaPreference {
    let distance = if is_cached {
        ReplicaPreference::CacheLocal
    } else {
        ReplicaPreference::DiskLocal
    };
    distance.max(base_distance)
}

/// Effective minimum memory distance for a node: the stricter of the query
/// option and the per-node hint, with `disable_cached_reads` forcing at least
/// disk-locality over either.
fn effective_base_distance(
    query_options: &QueryOptions,
    node_replica_preference: Option<ReplicaPreference>,
) -> ReplicaPreference {
    let mut base_distance = query_options.replica_preference;
    if let Some(node_preference) = node_replica_preference {
        base_distance = base_distance.max(node_preference);
    }
    if query_options.disable_cached_reads {
        base_distance = base_distance.max(ReplicaPreference::DiskLocal);
    }
    base_distance
}

fn host_for_replica<'h>(
    host_list: &'h [NetworkAddress],
    host_idx: usize,
) -> Result<&'h NetworkAddress> {
    host_list.get(host_idx).ok_or_else(|| {
        QuarryError::MalformedPlan(format!(
            "replica host index {host_idx} out of range ({} hosts in plan)",
            host_list.len()
        ))
    })
}

/// Read-path flags when a fixed backend executes the range: the read is local
/// iff a replica sits on the backend's host, cached iff that replica is
/// cached and the effective distance allows cache reads.
fn read_flags_for_backend(
    backend_config: &BackendConfig,
    backend_ip: &str,
    scan_range_locations: &ScanRangeLocations,
    host_list: &[NetworkAddress],
    base_distance: ReplicaPreference,
) -> Result<(bool, bool)> {
    let mut distance = ReplicaPreference::Remote;
    for location in &scan_range_locations.locations {
        let replica_host = host_for_replica(host_list, location.host_idx)?;
        let Some(replica_ip) = backend_config.lookup_backend_ip(&replica_host.hostname) else {
            continue;
        };
        if replica_ip == backend_ip {
            distance = distance.min(replica_memory_distance(location.is_cached, base_distance));
        }
    }
    let is_cached = distance == ReplicaPreference::CacheLocal;
    let is_remote = distance == ReplicaPreference::Remote;
    Ok((is_cached, is_remote))
}

/// Assign every scan range of one plan node to exactly one backend of
/// `backend_config`.
///
/// Ranges with an executor-local replica are placed first, by memory distance
/// and then by load; purely remote ranges are deferred and load-balanced over
/// unused backends and the assignment heap. With `exec_at_coord` all ranges
/// go to `local_backend` (the config is then the coordinator-only snapshot).
#[allow(clippy::too_many_arguments)]
pub fn compute_scan_range_assignment<R: Rng + ?Sized>(
    backend_config: &BackendConfig,
    local_backend: &BackendDescriptor,
    node_id: PlanNodeId,
    node_replica_preference: Option<ReplicaPreference>,
    node_random_replica: bool,
    locations: &[ScanRangeLocations],
    host_list: &[NetworkAddress],
    exec_at_coord: bool,
    query_options: &QueryOptions,
    rng: &mut R,
    assignment: &mut FragmentScanRangeAssignment,
) -> Result<NodeAssignmentStats> {
    if backend_config.is_empty() {
        return Err(QuarryError::NoExecutors(format!(
            "cannot assign scan ranges of node {node_id}: no executors registered"
        )));
    }

    let base_distance = effective_base_distance(query_options, node_replica_preference);
    let random_replica = query_options.schedule_random_replica || node_random_replica;

    let mut ctx = AssignmentCtx::new(backend_config, rng);
    let mut remote_scan_range_locations: Vec<&ScanRangeLocations> = Vec::new();

    for scan_range_locations in locations {
        if exec_at_coord {
            let (is_cached, is_remote) = read_flags_for_backend(
                ctx.backend_config(),
                &local_backend.ip_address,
                scan_range_locations,
                host_list,
                base_distance,
            )?;
            ctx.record_scan_range_assignment(
                local_backend,
                node_id,
                scan_range_locations,
                is_cached,
                is_remote,
                assignment,
            );
            continue;
        }

        // Collect executor candidates at the smallest observed memory
        // distance, clamped by the effective base distance.
        let mut min_distance = ReplicaPreference::Remote;
        let mut backend_candidates: Vec<IpAddr> = Vec::new();
        for location in &scan_range_locations.locations {
            let replica_host = host_for_replica(host_list, location.host_idx)?;
            if base_distance >= ReplicaPreference::Remote {
                continue;
            }
            let Some(backend_ip) = ctx.backend_config().lookup_backend_ip(&replica_host.hostname)
            else {
                continue;
            };
            let memory_distance = replica_memory_distance(location.is_cached, base_distance);
            if memory_distance >= ReplicaPreference::Remote {
                continue;
            }
            if memory_distance < min_distance {
                min_distance = memory_distance;
                backend_candidates.clear();
                backend_candidates.push(backend_ip.clone());
            } else if memory_distance == min_distance {
                backend_candidates.push(backend_ip.clone());
            }
        }

        if backend_candidates.is_empty() {
            remote_scan_range_locations.push(scan_range_locations);
            continue;
        }

        // Cache-local candidates always break ties by rank; disk-local ones
        // only when a random replica was requested.
        let cached_replica = min_distance == ReplicaPreference::CacheLocal;
        let break_ties_by_rank = random_replica || cached_replica;
        let backend_ip = ctx
            .select_local_backend_host(&backend_candidates, break_ties_by_rank)
            .ok_or_else(|| QuarryError::Internal("local candidate selection failed".to_string()))?;
        let backend = ctx.select_backend_on_host(&backend_ip)?;
        ctx.record_scan_range_assignment(
            &backend,
            node_id,
            scan_range_locations,
            cached_replica,
            false,
            assignment,
        );
    }

    for scan_range_locations in remote_scan_range_locations {
        let backend_ip = ctx
            .select_remote_backend_host()
            .ok_or_else(|| QuarryError::Internal("remote candidate selection failed".to_string()))?;
        let backend = ctx.select_backend_on_host(&backend_ip)?;
        ctx.record_scan_range_assignment(
            &backend,
            node_id,
            scan_range_locations,
            false,
            true,
            assignment,
        );
    }

    let stats = ctx.stats();
    debug!(
        node_id = %node_id,
        ranges = locations.len(),
        local = stats.num_local_assignments,
        remote = stats.num_remote_assignments,
        local_bytes = stats.byte_counters.local_bytes,
        cached_bytes = stats.byte_counters.cached_bytes,
        remote_bytes = stats.byte_counters.remote_bytes,
        "scan range assignment computed"
    );
    Ok(stats)
}
