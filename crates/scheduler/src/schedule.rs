//! Query schedule output model.
//!
//! A [`QuerySchedule`] is created per query, filled in by scan-range
//! assignment and fragment-instance planning, and never mutated after
//! `schedule()` returns. Fragment execution parameters are indexed by the
//! request's global fragment index.

use std::collections::{BTreeMap, HashMap};

use quarry_common::{
    FragmentIdx, FragmentInstanceId, PlanNodeId, QuarryError, QueryId, Result,
};

use crate::assignment::{FragmentScanRangeAssignment, NodeAssignmentStats, PerNodeScanRanges};
use crate::backend_config::NetworkAddress;
use crate::plan::QueryExecRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Receiver of a fragment's output stream.
pub struct PlanFragmentDestination {
    /// Fragment the receiving instance belongs to.
    pub fragment_idx: FragmentIdx,
    /// Instance index within the receiving fragment.
    pub instance_idx: usize,
    /// Receiving instance id.
    pub fragment_instance_id: FragmentInstanceId,
    /// Host the receiving instance runs on.
    pub server: NetworkAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One execution of a fragment on one host.
pub struct InstanceExecParams {
    /// Schedule-wide unique instance id.
    pub instance_id: FragmentInstanceId,
    /// Host executing this instance.
    pub host: NetworkAddress,
    /// Dense index of this instance within its fragment.
    pub per_fragment_instance_idx: usize,
    /// Scan ranges this instance reads, per scan node.
    pub per_node_scan_ranges: PerNodeScanRanges,
    /// Dense sender id towards the fragment's destination exchange; `None`
    /// for instances of the root fragment.
    pub sender_id: Option<usize>,
}

impl InstanceExecParams {
    /// New instance with no scan ranges and no sender id yet.
    pub fn new(
        instance_id: FragmentInstanceId,
        host: NetworkAddress,
        per_fragment_instance_idx: usize,
    ) -> Self {
        Self {
            instance_id,
            host,
            per_fragment_instance_idx,
            per_node_scan_ranges: PerNodeScanRanges::new(),
            sender_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Execution parameters of one fragment: its scan-range assignment, the
/// instances created from it, and the exchange wiring on both sides.
pub struct FragmentExecParams {
    /// Fragment this belongs to.
    pub fragment_idx: FragmentIdx,
    /// Scan ranges per executor address, filled by scan-range assignment.
    pub scan_range_assignment: FragmentScanRangeAssignment,
    /// Fragments sending into this fragment's exchange nodes.
    pub exchange_input_fragments: Vec<FragmentIdx>,
    /// Instances of this fragment, in sender-id order.
    pub instances: Vec<InstanceExecParams>,
    /// Instances of the consuming fragment this fragment streams to.
    pub destinations: Vec<PlanFragmentDestination>,
    /// Number of senders per exchange node of this fragment.
    pub per_exch_num_senders: BTreeMap<PlanNodeId, usize>,
}

impl FragmentExecParams {
    fn new(fragment_idx: FragmentIdx) -> Self {
        Self {
            fragment_idx,
            scan_range_assignment: FragmentScanRangeAssignment::new(),
            exchange_input_fragments: Vec::new(),
            instances: Vec::new(),
            destinations: Vec::new(),
            per_exch_num_senders: BTreeMap::new(),
        }
    }

    /// Hosts of this fragment's instances, in instance order.
    pub fn hosts(&self) -> Vec<NetworkAddress> {
        self.instances.iter().map(|i| i.host.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Aggregated assignment counters attached to a schedule.
pub struct AssignmentSummary {
    /// Scan ranges assigned across all plan nodes.
    pub num_assignments: u64,
    /// Assignments with a replica local to the chosen executor.
    pub num_local_assignments: u64,
    /// Assignments read remotely.
    pub num_remote_assignments: u64,
    /// Bytes read locally (cache or disk).
    pub local_bytes: i64,
    /// Subset of `local_bytes` served from cache.
    pub cached_bytes: i64,
    /// Bytes read over the network.
    pub remote_bytes: i64,
}

impl AssignmentSummary {
    /// Fold one node's assignment outcome into the summary.
    pub fn merge(&mut self, stats: &NodeAssignmentStats) {
        self.num_assignments += stats.num_assignments;
        self.num_local_assignments += stats.num_local_assignments;
        self.num_remote_assignments += stats.num_remote_assignments;
        self.local_bytes += stats.byte_counters.local_bytes;
        self.cached_bytes += stats.byte_counters.cached_bytes;
        self.remote_bytes += stats.byte_counters.remote_bytes;
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The scheduler's output: fragment instances, exchange wiring, and
/// assignment counters for one query.
pub struct QuerySchedule {
    query_id: QueryId,
    coord_address: NetworkAddress,
    request_pool: String,
    fragment_exec_params: Vec<FragmentExecParams>,
    plan_node_to_fragment: HashMap<PlanNodeId, FragmentIdx>,
    summary: AssignmentSummary,
    next_instance_id: u64,
}

impl QuerySchedule {
    /// Build the schedule skeleton for a request: one empty
    /// [`FragmentExecParams`] per fragment, the plan-node-to-fragment index,
    /// and the exchange input links derived from fragment output sinks.
    ///
    /// Validates that fragment indexes are dense across all plans and that
    /// every sink's destination exchange exists in some fragment.
    pub fn new(request: &QueryExecRequest, coord_address: NetworkAddress) -> Result<Self> {
        let mut fragment_exec_params = Vec::new();
        let mut plan_node_to_fragment = HashMap::new();
        for plan_exec_info in &request.plan_exec_info {
            for fragment in &plan_exec_info.fragments {
                if fragment.idx.0 != fragment_exec_params.len() {
                    return Err(QuarryError::MalformedPlan(format!(
                        "fragment '{}' has index {} but {} fragments precede it",
                        fragment.display_name,
                        fragment.idx,
                        fragment_exec_params.len()
                    )));
                }
                fragment_exec_params.push(FragmentExecParams::new(fragment.idx));
                index_plan_nodes(
                    &fragment.plan,
                    fragment.idx,
                    &mut plan_node_to_fragment,
                )?;
            }
        }

        let mut schedule = Self {
            query_id: request.query_id,
            coord_address,
            request_pool: String::new(),
            fragment_exec_params,
            plan_node_to_fragment,
            summary: AssignmentSummary::default(),
            next_instance_id: 0,
        };

        for plan_exec_info in &request.plan_exec_info {
            for fragment in &plan_exec_info.fragments {
                let Some(sink) = &fragment.output_sink else {
                    continue;
                };
                let dest_idx =
                    schedule
                        .fragment_idx_for_node(sink.dest_node_id)
                        .ok_or_else(|| {
                            QuarryError::MalformedPlan(format!(
                                "fragment '{}' streams to exchange {} which no fragment contains",
                                fragment.display_name, sink.dest_node_id
                            ))
                        })?;
                schedule
                    .fragment_mut(dest_idx)?
                    .exchange_input_fragments
                    .push(fragment.idx);
            }
        }
        Ok(schedule)
    }

    /// Query this schedule was computed for.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Address of the coordinator backend.
    pub fn coord_address(&self) -> &NetworkAddress {
        &self.coord_address
    }

    /// Admission pool resolved for this query.
    pub fn request_pool(&self) -> &str {
        &self.request_pool
    }

    /// Store the resolved admission pool.
    pub fn set_request_pool(&mut self, pool: String) {
        self.request_pool = pool;
    }

    /// Fragment owning the given plan node.
    pub fn fragment_idx_for_node(&self, node_id: PlanNodeId) -> Option<FragmentIdx> {
        self.plan_node_to_fragment.get(&node_id).copied()
    }

    /// Execution parameters of one fragment.
    pub fn fragment(&self, idx: FragmentIdx) -> Result<&FragmentExecParams> {
        self.fragment_exec_params
            .get(idx.0)
            .ok_or_else(|| QuarryError::Internal(format!("fragment index {idx} out of range")))
    }

    /// Mutable execution parameters of one fragment.
    pub fn fragment_mut(&mut self, idx: FragmentIdx) -> Result<&mut FragmentExecParams> {
        self.fragment_exec_params
            .get_mut(idx.0)
            .ok_or_else(|| QuarryError::Internal(format!("fragment index {idx} out of range")))
    }

    /// All fragment execution parameters, in fragment-index order.
    pub fn fragments(&self) -> &[FragmentExecParams] {
        &self.fragment_exec_params
    }

    /// Scan-range assignment map of one fragment (mutable).
    pub fn scan_range_assignment_mut(
        &mut self,
        idx: FragmentIdx,
    ) -> Result<&mut FragmentScanRangeAssignment> {
        Ok(&mut self.fragment_mut(idx)?.scan_range_assignment)
    }

    /// Aggregated assignment counters.
    pub fn summary(&self) -> &AssignmentSummary {
        &self.summary
    }

    /// Fold one node's assignment outcome into the schedule summary.
    pub fn merge_assignment_stats(&mut self, stats: &NodeAssignmentStats) {
        self.summary.merge(stats);
    }

    /// Next dense fragment-instance id.
    pub fn next_instance_id(&mut self) -> FragmentInstanceId {
        let id = FragmentInstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        id
    }

    /// Total number of fragment instances created so far.
    pub fn num_fragment_instances(&self) -> usize {
        self.fragment_exec_params
            .iter()
            .map(|f| f.instances.len())
            .sum()
    }
}

fn index_plan_nodes(
    node: &crate::plan::PlanNode,
    fragment_idx: FragmentIdx,
    out: &mut HashMap<PlanNodeId, FragmentIdx>,
) -> Result<()> {
    if out.insert(node.id, fragment_idx).is_some() {
        return Err(QuarryError::MalformedPlan(format!(
            "plan node id {} appears more than once",
            node.id
        )));
    }
    for child in &node.children {
        index_plan_nodes(child, fragment_idx, out)?;
    }
    Ok(())
}
