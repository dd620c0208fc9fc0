//! Scheduling facade: membership snapshot, scan-range assignment, fragment
//! expansion.
//!
//! `schedule()` is synchronous and reentrant. It loads the published cluster
//! snapshot once, assigns every scan node's ranges against it, expands
//! fragments into instances, and returns an immutable [`QuerySchedule`]. A
//! membership update never affects a scheduling pass already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use quarry_common::metrics::global_metrics;
use quarry_common::{QuarryError, QueryOptions, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::assignment::compute_scan_range_assignment;
use crate::backend_config::{BackendConfig, BackendDescriptor};
use crate::fragment::FragmentPlanner;
use crate::membership::MembershipTracker;
use crate::plan::{PartitionType, PlanNodeKind, QueryExecRequest};
use crate::schedule::QuerySchedule;

#[derive(Debug, Clone)]
/// Scheduler behavior knobs.
pub struct SchedulerConfig {
    /// Pool assigned when a query does not name one.
    pub default_pool_name: String,
    /// Restrict union fragments to hosts of their own scans instead of also
    /// covering every input-fragment host.
    pub union_restricted_to_scan_hosts: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_pool_name: "default-pool".to_string(),
            union_restricted_to_scan_hosts: false,
        }
    }
}

/// Resolves the admission pool for a user before scheduling. Implemented by
/// the admission-control service; failures abort the query without invoking
/// assignment.
pub trait RequestPoolResolver: Send + Sync {
    /// Pool name for the given user and options.
    fn resolve_pool(&self, user: &str, options: &QueryOptions) -> Result<String>;
}

/// Resolver used when no admission service is wired in: takes the requested
/// pool verbatim, falling back to a configured default.
#[derive(Debug, Clone)]
pub struct DefaultPoolResolver {
    default_pool: String,
}

impl DefaultPoolResolver {
    /// Resolver with the given fallback pool.
    pub fn new(default_pool: impl Into<String>) -> Self {
        Self {
            default_pool: default_pool.into(),
        }
    }
}

impl RequestPoolResolver for DefaultPoolResolver {
    fn resolve_pool(&self, _user: &str, options: &QueryOptions) -> Result<String> {
        if options.request_pool.is_empty() {
            Ok(self.default_pool.clone())
        } else {
            Ok(options.request_pool.clone())
        }
    }
}

/// Entry point for query scheduling.
///
/// Holds the membership tracker, the local (coordinator) backend descriptor,
/// and a coordinator-only snapshot used for `exec_at_coord` placement.
pub struct Scheduler {
    config: SchedulerConfig,
    membership: Arc<MembershipTracker>,
    local_backend: BackendDescriptor,
    coord_only_config: BackendConfig,
    pool_resolver: Box<dyn RequestPoolResolver>,
    num_assignments: AtomicU64,
}

impl Scheduler {
    /// Scheduler reading snapshots from `membership` and placing coordinator
    /// work on `local_backend`.
    pub fn new(
        config: SchedulerConfig,
        membership: Arc<MembershipTracker>,
        local_backend: BackendDescriptor,
    ) -> Self {
        let coord_only_config = BackendConfig::from_backends([local_backend.clone()]);
        let pool_resolver = Box::new(DefaultPoolResolver::new(config.default_pool_name.clone()));
        Self {
            config,
            membership,
            local_backend,
            coord_only_config,
            pool_resolver,
            num_assignments: AtomicU64::new(0),
        }
    }

    /// Replace the pool resolver with an external admission service.
    pub fn with_pool_resolver(mut self, resolver: Box<dyn RequestPoolResolver>) -> Self {
        self.pool_resolver = resolver;
        self
    }

    /// Scan-range assignments performed over the scheduler's lifetime.
    pub fn num_assignments(&self) -> u64 {
        self.num_assignments.load(Ordering::Relaxed)
    }

    /// Schedule with a seeded RNG; two calls with identical inputs and the
    /// same seed produce identical schedules.
    pub fn schedule_with_seed(
        &self,
        request: &QueryExecRequest,
        seed: u64,
    ) -> Result<QuerySchedule> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.schedule(request, &mut rng)
    }

    /// Compute the schedule for one query against the current snapshot.
    pub fn schedule<R: Rng + ?Sized>(
        &self,
        request: &QueryExecRequest,
        rng: &mut R,
    ) -> Result<QuerySchedule> {
        let start = Instant::now();
        let pool = self
            .pool_resolver
            .resolve_pool(&request.effective_user, &request.query_options)?;
        let snapshot = self.membership.snapshot();

        let mut schedule = QuerySchedule::new(request, self.local_backend.address.clone())?;
        schedule.set_request_pool(pool);
        self.compute_scan_range_assignments(request, &snapshot, &mut schedule, rng)?;
        FragmentPlanner::new(
            request,
            &self.local_backend,
            self.config.union_restricted_to_scan_hosts,
        )
        .compute_fragment_exec_params(&mut schedule)?;

        let summary = *schedule.summary();
        self.num_assignments
            .fetch_add(summary.num_assignments, Ordering::Relaxed);
        global_metrics().observe_schedule_time(start.elapsed().as_secs_f64());
        debug!(
            query_id = %schedule.query_id(),
            pool = %schedule.request_pool(),
            fragment_instances = schedule.num_fragment_instances(),
            assignments = summary.num_assignments,
            local_assignments = summary.num_local_assignments,
            remote_bytes = summary.remote_bytes,
            "query schedule computed"
        );
        Ok(schedule)
    }

    fn compute_scan_range_assignments<R: Rng + ?Sized>(
        &self,
        request: &QueryExecRequest,
        snapshot: &BackendConfig,
        schedule: &mut QuerySchedule,
        rng: &mut R,
    ) -> Result<()> {
        for plan_exec_info in &request.plan_exec_info {
            for (node_id, locations) in &plan_exec_info.per_node_scan_ranges {
                let fragment_idx = schedule.fragment_idx_for_node(*node_id).ok_or_else(|| {
                    QuarryError::MalformedPlan(format!(
                        "scan ranges delivered for unknown plan node {node_id}"
                    ))
                })?;
                let fragment = plan_exec_info.fragment(fragment_idx).ok_or_else(|| {
                    QuarryError::Internal(format!("fragment {fragment_idx} not part of its plan"))
                })?;
                let node = fragment.plan.find_node(*node_id).ok_or_else(|| {
                    QuarryError::Internal(format!("plan node {node_id} missing from fragment"))
                })?;
                let PlanNodeKind::Scan(scan_node) = &node.kind else {
                    return Err(QuarryError::MalformedPlan(format!(
                        "scan ranges delivered for non-scan node {node_id}"
                    )));
                };

                let exec_at_coord = fragment.partition == PartitionType::Unpartitioned;
                let backend_config = if exec_at_coord {
                    &self.coord_only_config
                } else {
                    snapshot
                };
                let stats = compute_scan_range_assignment(
                    backend_config,
                    &self.local_backend,
                    *node_id,
                    scan_node.replica_preference,
                    scan_node.random_replica,
                    locations,
                    &plan_exec_info.host_list,
                    exec_at_coord,
                    &request.query_options,
                    rng,
                    schedule.scan_range_assignment_mut(fragment_idx)?,
                )?;
                schedule.merge_assignment_stats(&stats);
            }
        }
        Ok(())
    }
}
