use thiserror::Error;

/// Canonical Quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::NoExecutors`]: the cluster snapshot has no executor to
///   place scan work on; the query fails with a retryable message
/// - [`QuarryError::MalformedPlan`]: plan-shape contract violations (host
///   indexes out of range, scans without assignments, dangling exchanges)
/// - [`QuarryError::PoolResolution`]: the external request-pool resolver
///   rejected the user/options combination; surfaced verbatim
/// - [`QuarryError::MembershipDecode`]: a statestore payload failed to decode;
///   callers log and skip, the membership tracker never aborts on these
/// - [`QuarryError::Internal`]: invariant violations inside scheduling that
///   indicate a bug rather than bad input
#[derive(Debug, Error)]
pub enum QuarryError {
    /// No executor backends registered in the snapshot used for scheduling.
    ///
    /// Examples:
    /// - query submitted before any executor joined the membership topic
    /// - all executors were removed by a recent topic delta
    #[error("no executors available: {0}")]
    NoExecutors(String),

    /// The exec request violates the plan/scan-range contract.
    ///
    /// Examples:
    /// - replica host index does not point into the plan's host list
    /// - fragment instance creation found a scan node without an assignment
    /// - data stream sink references an exchange node in no fragment
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// Request-pool resolution failed before scheduling started.
    #[error("pool resolution failed: {0}")]
    PoolResolution(String),

    /// A membership topic entry carried an undecodable backend descriptor.
    #[error("membership decode failed: {0}")]
    MembershipDecode(String),

    /// Scheduling reached a state that should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard Quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
