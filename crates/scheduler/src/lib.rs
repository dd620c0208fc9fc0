//! Distributed query scheduling building blocks.
//!
//! Architecture role:
//! - tracks cluster membership from statestore topic deltas and publishes
//!   immutable backend snapshots
//! - assigns scan ranges to executors by memory distance and load
//! - expands plan fragments into per-host instances and wires exchanges
//!
//! Key modules:
//! - [`backend_config`]
//! - [`membership`]
//! - [`plan`]
//! - [`assignment`]
//! - [`fragment`]
//! - [`schedule`]
//! - [`scheduler`]

pub mod assignment;
pub mod backend_config;
pub mod fragment;
pub mod membership;
pub mod plan;
pub mod schedule;
pub mod scheduler;

pub use assignment::{
    AddressableAssignmentHeap, AssignmentByteCounters, AssignmentCtx,
    FragmentScanRangeAssignment, NodeAssignmentStats, PerNodeScanRanges, ScanRangeParams,
};
pub use backend_config::{BackendConfig, BackendDescriptor, Hostname, IpAddr, NetworkAddress};
pub use membership::{
    decode_backend_descriptor, encode_backend_descriptor, MembershipTracker, TopicDelta,
    TopicEntry, CLUSTER_MEMBERSHIP_TOPIC,
};
pub use plan::{
    DataStreamSink, PartitionType, PlanExecInfo, PlanFragment, PlanNode, PlanNodeKind,
    QueryExecRequest, ReplicaLocation, ScanNode, ScanRange, ScanRangeLocations,
};
pub use schedule::{
    AssignmentSummary, FragmentExecParams, InstanceExecParams, PlanFragmentDestination,
    QuerySchedule,
};
pub use scheduler::{
    DefaultPoolResolver, RequestPoolResolver, Scheduler, SchedulerConfig,
};
