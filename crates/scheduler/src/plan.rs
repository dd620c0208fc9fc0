//! Plan-tree and scan-range input model handed to the scheduler.
//!
//! The planner frontend produces a [`QueryExecRequest`]: one or more plans,
//! each cut into fragments at exchange boundaries. Exchange nodes appear as
//! leaves of the fragment-local tree; the subtree feeding an exchange lives in
//! another fragment whose sink names the exchange node id. Scan ranges are
//! delivered per scan node, with replicas expressed as indices into a
//! plan-local host list.

use std::collections::BTreeMap;

use quarry_common::{FragmentIdx, PlanNodeId, QueryId, QueryOptions, ReplicaPreference};
use serde::{Deserialize, Serialize};

use crate::backend_config::NetworkAddress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A contiguous chunk of table data to be read by one executor.
pub struct ScanRange {
    /// Opaque reader-specific description of the range (file, offset, ...).
    pub spec: Vec<u8>,
    /// Length of the range in bytes. May be zero for metadata-only ranges.
    pub length_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// One physical replica of a scan range.
pub struct ReplicaLocation {
    /// Index into the plan-local host list.
    pub host_idx: usize,
    /// Whether the replica sits in the storage layer's cache on that host.
    pub is_cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A scan range together with all its replica locations.
pub struct ScanRangeLocations {
    /// The range to be read.
    pub scan_range: ScanRange,
    /// Replicas holding the range's data.
    pub locations: Vec<ReplicaLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Scheduling hints attached to a scan node by the planner.
pub struct ScanNode {
    /// Per-node override of the `replica_preference` query option.
    #[serde(default)]
    pub replica_preference: Option<ReplicaPreference>,
    /// Per-node equivalent of the `schedule_random_replica` query option.
    #[serde(default)]
    pub random_replica: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Node kinds the scheduler distinguishes. Anything that is not a scan,
/// union, or exchange behaves like `Aggregate` for placement purposes.
pub enum PlanNodeKind {
    /// Table scan with optional scheduling hints.
    Scan(ScanNode),
    /// Union over several children, possibly mixing scans and exchanges.
    Union,
    /// Exchange receiving data from another fragment; a leaf of this
    /// fragment's tree.
    Exchange,
    /// Hash join.
    HashJoin,
    /// Any blocking or streaming interior operator.
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One node of a fragment-local plan tree.
pub struct PlanNode {
    /// Plan-wide unique node id.
    pub id: PlanNodeId,
    /// Node kind.
    pub kind: PlanNodeKind,
    /// Child nodes, left to right.
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    /// Leaf node shorthand.
    pub fn leaf(id: PlanNodeId, kind: PlanNodeKind) -> Self {
        Self {
            id,
            kind,
            children: Vec::new(),
        }
    }

    /// Whether any node of this tree is a union.
    pub fn contains_union(&self) -> bool {
        matches!(self.kind, PlanNodeKind::Union)
            || self.children.iter().any(PlanNode::contains_union)
    }

    /// First scan node in left-first depth-first order. Exchange nodes are
    /// fragment boundaries and never match.
    pub fn find_leftmost_scan(&self) -> Option<PlanNodeId> {
        if matches!(self.kind, PlanNodeKind::Scan(_)) {
            return Some(self.id);
        }
        self.children.iter().find_map(PlanNode::find_leftmost_scan)
    }

    /// Ids of all scan nodes in this tree, left to right.
    pub fn collect_scan_ids(&self, out: &mut Vec<PlanNodeId>) {
        if matches!(self.kind, PlanNodeKind::Scan(_)) {
            out.push(self.id);
        }
        for child in &self.children {
            child.collect_scan_ids(out);
        }
    }

    /// Find a node by id.
    pub fn find_node(&self, id: PlanNodeId) -> Option<&PlanNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_node(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How a fragment's output (or the fragment itself) is partitioned.
pub enum PartitionType {
    /// Single partition; the fragment runs as one instance on the
    /// coordinator.
    Unpartitioned,
    /// Partitioned by a hash of the sink's partition expressions.
    HashPartitioned,
    /// Partitioned arbitrarily (scan-driven fragments).
    RandomPartitioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Sink sending a fragment's output to an exchange node in another fragment.
pub struct DataStreamSink {
    /// Exchange node receiving this fragment's rows.
    pub dest_node_id: PlanNodeId,
    /// Partitioning applied to the outgoing stream.
    pub output_partition: PartitionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Maximal plan subtree without crossing exchanges.
pub struct PlanFragment {
    /// Index unique across all plans of the exec request.
    pub idx: FragmentIdx,
    /// Human-readable label for logs.
    pub display_name: String,
    /// Root of the fragment-local tree.
    pub plan: PlanNode,
    /// Partitioning of the fragment's execution.
    pub partition: PartitionType,
    /// Output sink; `None` for the root fragment of a plan.
    pub output_sink: Option<DataStreamSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One executable plan: its fragments, host list, and scan ranges.
pub struct PlanExecInfo {
    /// Fragments of this plan; `fragments[0]` is the root fragment.
    pub fragments: Vec<PlanFragment>,
    /// Datanode addresses referenced by replica locations.
    pub host_list: Vec<NetworkAddress>,
    /// Scan ranges per scan node, keyed by plan node id.
    pub per_node_scan_ranges: BTreeMap<PlanNodeId, Vec<ScanRangeLocations>>,
}

impl PlanExecInfo {
    /// Fragment with the given index, if it belongs to this plan.
    pub fn fragment(&self, idx: FragmentIdx) -> Option<&PlanFragment> {
        self.fragments.iter().find(|f| f.idx == idx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Everything the scheduler needs to place one query.
pub struct QueryExecRequest {
    /// Stable query identifier.
    pub query_id: QueryId,
    /// Session user, used for request-pool resolution.
    pub effective_user: String,
    /// Plans of the query. Most queries have exactly one.
    pub plan_exec_info: Vec<PlanExecInfo>,
    /// Per-query scheduling options.
    pub query_options: QueryOptions,
}

#[cfg(test)]
mod tests {
    use super::{PlanNode, PlanNodeKind, ScanNode};
    use quarry_common::PlanNodeId;

    fn scan(id: u64) -> PlanNode {
        PlanNode::leaf(PlanNodeId(id), PlanNodeKind::Scan(ScanNode::default()))
    }

    fn exchange(id: u64) -> PlanNode {
        PlanNode::leaf(PlanNodeId(id), PlanNodeKind::Exchange)
    }

    #[test]
    fn leftmost_scan_prefers_left_subtree() {
        let join = PlanNode {
            id: PlanNodeId(2),
            kind: PlanNodeKind::HashJoin,
            children: vec![scan(0), exchange(1)],
        };
        assert_eq!(join.find_leftmost_scan(), Some(PlanNodeId(0)));
    }

    #[test]
    fn leftmost_scan_skips_exchange_leaves() {
        let join = PlanNode {
            id: PlanNodeId(2),
            kind: PlanNodeKind::HashJoin,
            children: vec![exchange(1), scan(0)],
        };
        assert_eq!(join.find_leftmost_scan(), Some(PlanNodeId(0)));
    }

    #[test]
    fn no_leftmost_scan_in_exchange_only_tree() {
        let agg = PlanNode {
            id: PlanNodeId(3),
            kind: PlanNodeKind::Aggregate,
            children: vec![exchange(1)],
        };
        assert_eq!(agg.find_leftmost_scan(), None);
    }

    #[test]
    fn collects_scans_left_to_right() {
        let union = PlanNode {
            id: PlanNodeId(4),
            kind: PlanNodeKind::Union,
            children: vec![scan(0), exchange(1), scan(2)],
        };
        let mut ids = Vec::new();
        union.collect_scan_ids(&mut ids);
        assert_eq!(ids, vec![PlanNodeId(0), PlanNodeId(2)]);
        assert!(union.contains_union());
    }
}
