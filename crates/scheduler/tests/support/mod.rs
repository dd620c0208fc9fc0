#![allow(dead_code)]

//! Test model for scheduling scenarios: a cluster of hosts with backend and
//! datanode roles, a schema of replicated blocks, and a plan builder that
//! produces full exec requests. Blocks map 1:1 to scan ranges and default to
//! one megabyte.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quarry_common::{FragmentIdx, PlanNodeId, QueryId, QueryOptions};
use quarry_scheduler::{
    BackendDescriptor, DataStreamSink, MembershipTracker, NetworkAddress, PartitionType,
    PlanExecInfo, PlanFragment, PlanNode, PlanNodeKind, QueryExecRequest, QuerySchedule,
    ReplicaLocation, ScanNode, ScanRange, ScanRangeLocations, ScanRangeParams, Scheduler,
    SchedulerConfig,
};

/// Default block (and scan range) size.
pub const BLOCK_SIZE: i64 = 1024 * 1024;

const BACKEND_PORT: u16 = 22000;
const DATANODE_PORT: u16 = 20500;

const ROOT_NODE_ID: u64 = 200;
const EXCHANGE_NODE_BASE: u64 = 100;

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub ip: String,
    pub has_backend: bool,
    pub has_datanode: bool,
    pub is_executor: bool,
}

/// Cluster of hosts with unique hostnames and IP addresses.
#[derive(Debug, Default)]
pub struct Cluster {
    hosts: Vec<Host>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host and return its index.
    pub fn add_host(&mut self, has_backend: bool, has_datanode: bool, is_executor: bool) -> usize {
        let idx = self.hosts.len();
        self.hosts.push(Host {
            name: format!("host_{idx}"),
            ip: format!("10.0.0.{}", idx + 1),
            has_backend,
            has_datanode,
            is_executor,
        });
        idx
    }

    pub fn add_hosts(
        &mut self,
        num_hosts: usize,
        has_backend: bool,
        has_datanode: bool,
        is_executor: bool,
    ) {
        for _ in 0..num_hosts {
            self.add_host(has_backend, has_datanode, is_executor);
        }
    }

    pub fn host(&self, idx: usize) -> &Host {
        &self.hosts[idx]
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn backend_address(&self, idx: usize) -> NetworkAddress {
        NetworkAddress::new(self.hosts[idx].name.clone(), BACKEND_PORT)
    }

    pub fn datanode_address(&self, idx: usize) -> NetworkAddress {
        NetworkAddress::new(self.hosts[idx].name.clone(), DATANODE_PORT)
    }

    /// Descriptors for every host with a backend.
    pub fn backend_descriptors(&self) -> Vec<BackendDescriptor> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.has_backend)
            .map(|(idx, h)| BackendDescriptor {
                address: self.backend_address(idx),
                ip_address: h.ip.clone(),
                is_coordinator: true,
                is_executor: h.is_executor,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub length: i64,
    /// Cluster host indexes holding a replica, paired with the cached flag.
    pub replicas: Vec<(usize, bool)>,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub blocks: Vec<Block>,
}

/// Tables with replicated blocks on cluster hosts.
pub struct Schema {
    cluster: Cluster,
    tables: HashMap<String, Table>,
}

impl Schema {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            tables: HashMap::new(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Table with one block; `uncached` and `cached` name replica hosts by
    /// cluster index and must be disjoint.
    pub fn add_single_block_table(&mut self, name: &str, uncached: &[usize], cached: &[usize]) {
        let mut replicas: Vec<(usize, bool)> =
            uncached.iter().map(|&idx| (idx, false)).collect();
        replicas.extend(cached.iter().map(|&idx| (idx, true)));
        self.tables.insert(
            name.to_string(),
            Table {
                blocks: vec![Block {
                    length: BLOCK_SIZE,
                    replicas,
                }],
            },
        );
    }

    /// Table with `num_blocks` blocks, each replicated uncached on the same
    /// hosts.
    pub fn add_uniform_table(&mut self, name: &str, num_blocks: usize, replica_idxs: &[usize]) {
        let blocks = (0..num_blocks)
            .map(|_| Block {
                length: BLOCK_SIZE,
                replicas: replica_idxs.iter().map(|&idx| (idx, false)).collect(),
            })
            .collect();
        self.tables.insert(name.to_string(), Table { blocks });
    }

    pub fn table(&self, name: &str) -> &Table {
        &self.tables[name]
    }
}

/// Builds exec requests over a schema: one root fragment on the coordinator
/// plus one scan fragment per `add_table_scan` call.
pub struct Plan<'a> {
    schema: &'a Schema,
    pub query_options: QueryOptions,
    referenced_hosts: Vec<NetworkAddress>,
    host_idx_map: HashMap<usize, usize>,
    per_node_scan_ranges: BTreeMap<PlanNodeId, Vec<ScanRangeLocations>>,
    scan_node_ids: Vec<PlanNodeId>,
}

impl<'a> Plan<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            query_options: QueryOptions::default(),
            referenced_hosts: Vec::new(),
            host_idx_map: HashMap::new(),
            per_node_scan_ranges: BTreeMap::new(),
            scan_node_ids: Vec::new(),
        }
    }

    /// Add a scan over all blocks of a table; returns the new scan node id.
    pub fn add_table_scan(&mut self, table_name: &str) -> PlanNodeId {
        let node_id = PlanNodeId(self.scan_node_ids.len() as u64);
        self.scan_node_ids.push(node_id);
        let table = self.schema.table(table_name);
        let mut ranges = Vec::new();
        for (block_idx, block) in table.blocks.iter().enumerate() {
            let locations = block
                .replicas
                .iter()
                .map(|&(cluster_idx, is_cached)| ReplicaLocation {
                    host_idx: self.plan_host_idx(cluster_idx),
                    is_cached,
                })
                .collect();
            ranges.push(ScanRangeLocations {
                scan_range: ScanRange {
                    spec: format!("{table_name}/{block_idx}").into_bytes(),
                    length_bytes: block.length,
                },
                locations,
            });
        }
        self.per_node_scan_ranges.insert(node_id, ranges);
        node_id
    }

    fn plan_host_idx(&mut self, cluster_idx: usize) -> usize {
        if let Some(&idx) = self.host_idx_map.get(&cluster_idx) {
            return idx;
        }
        let idx = self.referenced_hosts.len();
        self.referenced_hosts
            .push(self.schema.cluster.datanode_address(cluster_idx));
        self.host_idx_map.insert(cluster_idx, idx);
        idx
    }

    /// Request with a coordinator root fragment consuming one exchange per
    /// scan fragment.
    pub fn build(&self, query_id: u64) -> QueryExecRequest {
        let exchanges: Vec<PlanNode> = (0..self.scan_node_ids.len())
            .map(|i| {
                PlanNode::leaf(
                    PlanNodeId(EXCHANGE_NODE_BASE + i as u64),
                    PlanNodeKind::Exchange,
                )
            })
            .collect();
        let mut fragments = vec![PlanFragment {
            idx: FragmentIdx(0),
            display_name: "root".to_string(),
            plan: PlanNode {
                id: PlanNodeId(ROOT_NODE_ID),
                kind: PlanNodeKind::Aggregate,
                children: exchanges,
            },
            partition: PartitionType::Unpartitioned,
            output_sink: None,
        }];
        for (i, scan_id) in self.scan_node_ids.iter().enumerate() {
            fragments.push(PlanFragment {
                idx: FragmentIdx(i + 1),
                display_name: format!("scan-{i}"),
                plan: PlanNode::leaf(*scan_id, PlanNodeKind::Scan(ScanNode::default())),
                partition: PartitionType::RandomPartitioned,
                output_sink: Some(DataStreamSink {
                    dest_node_id: PlanNodeId(EXCHANGE_NODE_BASE + i as u64),
                    output_partition: PartitionType::Unpartitioned,
                }),
            });
        }
        self.request(query_id, fragments)
    }

    /// Request with a single unpartitioned fragment holding the scans, so all
    /// ranges execute on the coordinator.
    pub fn build_coord_only(&self, query_id: u64) -> QueryExecRequest {
        let plan = match self.scan_node_ids.as_slice() {
            [] => PlanNode::leaf(PlanNodeId(ROOT_NODE_ID), PlanNodeKind::Aggregate),
            [scan_id] => PlanNode {
                id: PlanNodeId(ROOT_NODE_ID),
                kind: PlanNodeKind::Aggregate,
                children: vec![PlanNode::leaf(
                    *scan_id,
                    PlanNodeKind::Scan(ScanNode::default()),
                )],
            },
            _ => panic!("coord-only plans support at most one scan"),
        };
        let fragments = vec![PlanFragment {
            idx: FragmentIdx(0),
            display_name: "root".to_string(),
            plan,
            partition: PartitionType::Unpartitioned,
            output_sink: None,
        }];
        self.request(query_id, fragments)
    }

    fn request(&self, query_id: u64, fragments: Vec<PlanFragment>) -> QueryExecRequest {
        QueryExecRequest {
            query_id: QueryId(query_id),
            effective_user: "test-user".to_string(),
            plan_exec_info: vec![PlanExecInfo {
                fragments,
                host_list: self.referenced_hosts.clone(),
                per_node_scan_ranges: self.per_node_scan_ranges.clone(),
            }],
            query_options: self.query_options.clone(),
        }
    }
}

/// Membership tracker plus a scheduler whose coordinator is the cluster's
/// first backend.
pub fn make_scheduler(schema: &Schema) -> (Arc<MembershipTracker>, Scheduler) {
    let descriptors = schema.cluster().backend_descriptors();
    let coord = descriptors
        .first()
        .cloned()
        .expect("cluster needs at least one backend");
    let tracker = Arc::new(MembershipTracker::with_static_backends(descriptors));
    let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::clone(&tracker), coord);
    (tracker, scheduler)
}

/// Assignment-counting helpers over a computed schedule.
pub struct SchedResult<'a> {
    schedule: &'a QuerySchedule,
}

impl<'a> SchedResult<'a> {
    pub fn new(schedule: &'a QuerySchedule) -> Self {
        Self { schedule }
    }

    fn for_each_assignment(&self, mut f: impl FnMut(&NetworkAddress, &ScanRangeParams)) {
        for fragment in self.schedule.fragments() {
            for (host, per_node) in &fragment.scan_range_assignment {
                for ranges in per_node.values() {
                    for params in ranges {
                        f(host, params);
                    }
                }
            }
        }
    }

    pub fn num_total_assignments(&self) -> usize {
        let mut count = 0;
        self.for_each_assignment(|_, _| count += 1);
        count
    }

    pub fn num_total_assigned_bytes(&self) -> i64 {
        let mut bytes = 0;
        self.for_each_assignment(|_, p| bytes += p.scan_range.length_bytes);
        bytes
    }

    pub fn num_cached_assigned_bytes(&self) -> i64 {
        let mut bytes = 0;
        self.for_each_assignment(|_, p| {
            if p.is_cached {
                bytes += p.scan_range.length_bytes;
            }
        });
        bytes
    }

    pub fn num_disk_assigned_bytes(&self) -> i64 {
        let mut bytes = 0;
        self.for_each_assignment(|_, p| {
            if !p.is_cached && !p.is_remote {
                bytes += p.scan_range.length_bytes;
            }
        });
        bytes
    }

    pub fn num_remote_assigned_bytes(&self) -> i64 {
        let mut bytes = 0;
        self.for_each_assignment(|_, p| {
            if p.is_remote {
                bytes += p.scan_range.length_bytes;
            }
        });
        bytes
    }

    pub fn assigned_bytes_per_host(&self) -> BTreeMap<String, i64> {
        let mut per_host = BTreeMap::new();
        self.for_each_assignment(|host, p| {
            *per_host.entry(host.hostname.clone()).or_insert(0) += p.scan_range.length_bytes;
        });
        per_host
    }

    pub fn hosts_with_assignments(&self) -> Vec<String> {
        self.assigned_bytes_per_host().into_keys().collect()
    }

    pub fn assigned_bytes_to(&self, hostname: &str) -> i64 {
        self.assigned_bytes_per_host()
            .get(hostname)
            .copied()
            .unwrap_or(0)
    }
}
