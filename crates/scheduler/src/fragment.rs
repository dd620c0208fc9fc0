//! Fragment-instance planning and exchange wiring.
//!
//! Contract:
//! - instances are created bottom-up: every input fragment is expanded before
//!   its consumer, so collocated and union placement can read input hosts;
//! - unpartitioned fragments run as a single instance on the coordinator;
//! - scan-driven fragments run one instance per assigned host, split into up
//!   to `mt_dop` byte-balanced instances per host;
//! - sender ids are dense per destination exchange, accumulated across all
//!   producer fragments feeding it.

use std::collections::BTreeMap;

use quarry_common::{FragmentIdx, PlanNodeId, QuarryError, Result};

use crate::assignment::ScanRangeParams;
use crate::backend_config::{BackendDescriptor, NetworkAddress};
use crate::plan::{PartitionType, PlanExecInfo, PlanFragment, QueryExecRequest};
use crate::schedule::{InstanceExecParams, PlanFragmentDestination, QuerySchedule};

/// Expands fragments of one exec request into per-host instances and wires
/// the exchanges between them.
pub struct FragmentPlanner<'a> {
    request: &'a QueryExecRequest,
    coord_backend: &'a BackendDescriptor,
    /// When set, union fragments run only on hosts of their own scans instead
    /// of also covering every input-fragment host.
    union_restricted_to_scan_hosts: bool,
}

impl<'a> FragmentPlanner<'a> {
    /// Planner for one request.
    pub fn new(
        request: &'a QueryExecRequest,
        coord_backend: &'a BackendDescriptor,
        union_restricted_to_scan_hosts: bool,
    ) -> Self {
        Self {
            request,
            coord_backend,
            union_restricted_to_scan_hosts,
        }
    }

    /// Create all fragment instances and wire exchange destinations, sender
    /// ids, and per-exchange sender counts.
    pub fn compute_fragment_exec_params(&self, schedule: &mut QuerySchedule) -> Result<()> {
        for plan_exec_info in &self.request.plan_exec_info {
            let root_idx = plan_exec_info
                .fragments
                .first()
                .ok_or_else(|| QuarryError::MalformedPlan("plan without fragments".to_string()))?
                .idx;
            self.compute_instances(plan_exec_info, root_idx, schedule)?;
            self.wire_exchanges(plan_exec_info, schedule)?;
        }
        Ok(())
    }

    fn compute_instances(
        &self,
        plan_exec_info: &PlanExecInfo,
        fragment_idx: FragmentIdx,
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        let input_fragments = schedule.fragment(fragment_idx)?.exchange_input_fragments.clone();
        for input_idx in &input_fragments {
            self.compute_instances(plan_exec_info, *input_idx, schedule)?;
        }
        let fragment = plan_exec_info.fragment(fragment_idx).ok_or_else(|| {
            QuarryError::Internal(format!("fragment {fragment_idx} not part of its plan"))
        })?;

        if fragment.partition == PartitionType::Unpartitioned {
            self.create_coordinator_instance(fragment_idx, schedule)
        } else if fragment.plan.contains_union() {
            self.create_union_instances(fragment, &input_fragments, schedule)
        } else if let Some(scan_id) = fragment.plan.find_leftmost_scan() {
            self.create_scan_instances(scan_id, fragment_idx, schedule)
        } else {
            self.create_collocated_instances(fragment, &input_fragments, schedule)
        }
    }

    /// Single instance on the coordinator, carrying any scan ranges that were
    /// assigned there by `exec_at_coord`.
    fn create_coordinator_instance(
        &self,
        fragment_idx: FragmentIdx,
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        let assignment = schedule.fragment(fragment_idx)?.scan_range_assignment.clone();
        if assignment.len() > 1 {
            return Err(QuarryError::Internal(format!(
                "unpartitioned fragment {fragment_idx} has assignments on {} hosts",
                assignment.len()
            )));
        }
        let instance_id = schedule.next_instance_id();
        let mut instance =
            InstanceExecParams::new(instance_id, self.coord_backend.address.clone(), 0);
        if let Some((_, per_node)) = assignment.into_iter().next() {
            instance.per_node_scan_ranges = per_node;
        }
        schedule.fragment_mut(fragment_idx)?.instances.push(instance);
        Ok(())
    }

    /// One instance per host of the driving scan's assignment; with
    /// `mt_dop > 1` each host's ranges split into byte-balanced instances.
    fn create_scan_instances(
        &self,
        scan_id: PlanNodeId,
        fragment_idx: FragmentIdx,
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        let assignment = schedule.fragment(fragment_idx)?.scan_range_assignment.clone();
        if assignment.is_empty() {
            // Scan without any ranges: a single instance on the coordinator.
            let instance_id = schedule.next_instance_id();
            schedule.fragment_mut(fragment_idx)?.instances.push(
                InstanceExecParams::new(instance_id, self.coord_backend.address.clone(), 0),
            );
            return Ok(());
        }

        let max_instances = self.request.query_options.mt_dop.max(1) as usize;
        let mut per_fragment_instance_idx = 0;
        for (host, per_node) in &assignment {
            let driving_ranges = per_node.get(&scan_id).ok_or_else(|| {
                QuarryError::MalformedPlan(format!(
                    "host {host} has no assignment for driving scan {scan_id}"
                ))
            })?;
            let num_instances = max_instances.min(driving_ranges.len()).max(1);

            if num_instances == 1 {
                let instance_id = schedule.next_instance_id();
                let mut instance =
                    InstanceExecParams::new(instance_id, host.clone(), per_fragment_instance_idx);
                per_fragment_instance_idx += 1;
                instance.per_node_scan_ranges = per_node.clone();
                schedule.fragment_mut(fragment_idx)?.instances.push(instance);
                continue;
            }

            let splits: BTreeMap<PlanNodeId, Vec<Vec<ScanRangeParams>>> = per_node
                .iter()
                .map(|(node_id, ranges)| (*node_id, split_ranges_by_bytes(ranges, num_instances)))
                .collect();
            for bucket_idx in 0..num_instances {
                let instance_id = schedule.next_instance_id();
                let mut instance =
                    InstanceExecParams::new(instance_id, host.clone(), per_fragment_instance_idx);
                per_fragment_instance_idx += 1;
                for (node_id, buckets) in &splits {
                    if let Some(bucket) = buckets.get(bucket_idx) {
                        if !bucket.is_empty() {
                            instance.per_node_scan_ranges.insert(*node_id, bucket.clone());
                        }
                    }
                }
                schedule.fragment_mut(fragment_idx)?.instances.push(instance);
            }
        }
        Ok(())
    }

    /// Union fragments run on the union of their scan hosts and the hosts of
    /// all input-fragment instances, one instance per host.
    fn create_union_instances(
        &self,
        fragment: &PlanFragment,
        input_fragments: &[FragmentIdx],
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        let fragment_idx = fragment.idx;
        let mut scan_ids = Vec::new();
        fragment.plan.collect_scan_ids(&mut scan_ids);
        let mut hosts: Vec<NetworkAddress> = Vec::new();
        for scan_id in &scan_ids {
            self.get_scan_hosts(*scan_id, fragment_idx, schedule, &mut hosts)?;
        }
        if !self.union_restricted_to_scan_hosts {
            for input_idx in input_fragments {
                for instance in &schedule.fragment(*input_idx)?.instances {
                    hosts.push(instance.host.clone());
                }
            }
        }
        hosts.sort();
        hosts.dedup();

        let assignment = schedule.fragment(fragment_idx)?.scan_range_assignment.clone();
        for (instance_idx, host) in hosts.into_iter().enumerate() {
            let instance_id = schedule.next_instance_id();
            let mut instance = InstanceExecParams::new(instance_id, host.clone(), instance_idx);
            if let Some(per_node) = assignment.get(&host) {
                instance.per_node_scan_ranges = per_node.clone();
            }
            schedule.fragment_mut(fragment_idx)?.instances.push(instance);
        }
        Ok(())
    }

    /// Interior fragments without scans collocate with their first input
    /// fragment so merge operators run where their input is produced.
    fn create_collocated_instances(
        &self,
        fragment: &PlanFragment,
        input_fragments: &[FragmentIdx],
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        let input_idx = input_fragments.first().copied().ok_or_else(|| {
            QuarryError::Internal(format!(
                "fragment '{}' has neither scans nor input fragments",
                fragment.display_name
            ))
        })?;
        let input_hosts = schedule.fragment(input_idx)?.hosts();
        for (instance_idx, host) in input_hosts.into_iter().enumerate() {
            let instance_id = schedule.next_instance_id();
            schedule
                .fragment_mut(fragment.idx)?
                .instances
                .push(InstanceExecParams::new(instance_id, host, instance_idx));
        }
        Ok(())
    }

    /// Hosts the given scan executes on; a scan without assignments runs on
    /// the coordinator.
    fn get_scan_hosts(
        &self,
        scan_id: PlanNodeId,
        fragment_idx: FragmentIdx,
        schedule: &QuerySchedule,
        out: &mut Vec<NetworkAddress>,
    ) -> Result<()> {
        let params = schedule.fragment(fragment_idx)?;
        let mut found = false;
        for (host, per_node) in &params.scan_range_assignment {
            if per_node.contains_key(&scan_id) {
                out.push(host.clone());
                found = true;
            }
        }
        if !found {
            out.push(self.coord_backend.address.clone());
        }
        Ok(())
    }

    /// Fill destinations, dense sender ids, and per-exchange sender counts
    /// for every fragment streaming into an exchange.
    fn wire_exchanges(
        &self,
        plan_exec_info: &PlanExecInfo,
        schedule: &mut QuerySchedule,
    ) -> Result<()> {
        for src_fragment in &plan_exec_info.fragments {
            let Some(sink) = &src_fragment.output_sink else {
                continue;
            };
            let dest_idx = schedule
                .fragment_idx_for_node(sink.dest_node_id)
                .ok_or_else(|| {
                    QuarryError::MalformedPlan(format!(
                        "destination exchange {} not found in any fragment",
                        sink.dest_node_id
                    ))
                })?;

            let destinations: Vec<PlanFragmentDestination> = schedule
                .fragment(dest_idx)?
                .instances
                .iter()
                .enumerate()
                .map(|(instance_idx, instance)| PlanFragmentDestination {
                    fragment_idx: dest_idx,
                    instance_idx,
                    fragment_instance_id: instance.instance_id,
                    server: instance.host.clone(),
                })
                .collect();
            let num_senders = schedule.fragment(src_fragment.idx)?.instances.len();

            // Sender ids are enumerated consecutively across all fragments
            // feeding the same exchange.
            let sender_id_base = {
                let dest = schedule.fragment_mut(dest_idx)?;
                let count = dest.per_exch_num_senders.entry(sink.dest_node_id).or_insert(0);
                let base = *count;
                *count += num_senders;
                base
            };

            let src = schedule.fragment_mut(src_fragment.idx)?;
            src.destinations = destinations;
            for (idx, instance) in src.instances.iter_mut().enumerate() {
                instance.sender_id = Some(sender_id_base + idx);
            }
        }
        Ok(())
    }
}

/// Split ranges into `num_instances` contiguous buckets aiming for equal
/// bytes: the cursor advances to the next bucket once cumulative bytes pass
/// `avg * (bucket + 1)`. Zero-length ranges weigh one byte.
fn split_ranges_by_bytes(
    ranges: &[ScanRangeParams],
    num_instances: usize,
) -> Vec<Vec<ScanRangeParams>> {
    let weight = |r: &ScanRangeParams| r.scan_range.length_bytes.max(1);
    let total_bytes: i64 = ranges.iter().map(weight).sum();
    let avg_bytes_per_instance = total_bytes as f64 / num_instances as f64;
    let mut buckets: Vec<Vec<ScanRangeParams>> = vec![Vec::new(); num_instances];
    let mut total_assigned: i64 = 0;
    let mut range_idx = 0;
    for (bucket_idx, bucket) in buckets.iter_mut().enumerate() {
        let threshold = avg_bytes_per_instance * (bucket_idx + 1) as f64;
        while range_idx < ranges.len() {
            bucket.push(ranges[range_idx].clone());
            total_assigned += weight(&ranges[range_idx]);
            range_idx += 1;
            if total_assigned as f64 >= threshold {
                break;
            }
        }
        if range_idx == ranges.len() {
            break;
        }
    }
    debug_assert_eq!(range_idx, ranges.len(), "all ranges distributed");
    buckets
}

#[cfg(test)]
mod tests {
    use super::split_ranges_by_bytes;
    use crate::assignment::ScanRangeParams;
    use crate::plan::ScanRange;

    fn params(length: i64) -> ScanRangeParams {
        ScanRangeParams {
            scan_range: ScanRange {
                spec: Vec::new(),
                length_bytes: length,
            },
            is_cached: false,
            is_remote: false,
        }
    }

    #[test]
    fn splits_equal_ranges_evenly() {
        let ranges: Vec<_> = (0..8).map(|_| params(1024)).collect();
        let buckets = split_ranges_by_bytes(&ranges, 4);
        assert_eq!(buckets.len(), 4);
        for bucket in &buckets {
            assert_eq!(bucket.len(), 2);
        }
    }

    #[test]
    fn splits_everything_despite_skew() {
        let ranges = vec![params(1), params(100), params(1), params(1)];
        let buckets = split_ranges_by_bytes(&ranges, 2);
        let assigned: usize = buckets.iter().map(Vec::len).sum();
        assert_eq!(assigned, 4);
    }

    #[test]
    fn zero_length_ranges_count_as_one_byte() {
        let ranges = vec![params(0), params(0), params(0), params(0)];
        let buckets = split_ranges_by_bytes(&ranges, 2);
        assert_eq!(buckets[0].len(), 2);
        assert_eq!(buckets[1].len(), 2);
    }
}
