//! Immutable cluster snapshots used during scan-range assignment.
//!
//! Contract:
//! - a snapshot is built once (by the membership tracker or a static seed)
//!   and never mutated after publication;
//! - executors are indexed by IP address and by hostname;
//! - multiple backends may share an IP address (distinct ports).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical textual IP address used as the backend key.
pub type IpAddr = String;

/// Hostname as reported by the storage layer or the statestore.
pub type Hostname = String;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Address a backend or datanode listens on.
pub struct NetworkAddress {
    /// Hostname part; may itself be a textual IP address.
    pub hostname: Hostname,
    /// Service port.
    pub port: u16,
}

impl NetworkAddress {
    /// Build an address from hostname and port.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One backend process as announced on the membership topic.
pub struct BackendDescriptor {
    /// Address the backend serves fragment instances on.
    pub address: NetworkAddress,
    /// Resolved IP address; the canonical key for locality matching.
    pub ip_address: IpAddr,
    /// Whether this backend can coordinate queries.
    #[serde(default)]
    pub is_coordinator: bool,
    /// Whether this backend accepts executor fragment instances.
    #[serde(default = "default_true")]
    pub is_executor: bool,
}

fn default_true() -> bool {
    true
}

impl BackendDescriptor {
    /// Descriptor for a combined coordinator/executor backend.
    pub fn new(address: NetworkAddress, ip_address: impl Into<String>) -> Self {
        Self {
            address,
            ip_address: ip_address.into(),
            is_coordinator: true,
            is_executor: true,
        }
    }
}

/// Read-only view of the executor cluster used by one scheduling pass.
///
/// Host lists in exec requests may carry hostnames or raw IP literals, so both
/// spellings resolve through [`BackendConfig::lookup_backend_ip`]. When a
/// hostname maps to several IPs the first registration wins; the choice is
/// stable for the lifetime of the snapshot because snapshots are rebuilt from
/// sorted membership keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendConfig {
    /// Backends per IP address; more than one entry means multiple backends
    /// share a host.
    backend_map: HashMap<IpAddr, Vec<BackendDescriptor>>,
    backend_ip_map: HashMap<Hostname, IpAddr>,
}

impl BackendConfig {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from a fixed backend list (static cluster mode).
    pub fn from_backends(backends: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let mut config = Self::new();
        for be in backends {
            config.add_backend(be);
        }
        config
    }

    /// Register a backend under its IP and hostname. Only called while the
    /// snapshot is being built.
    pub fn add_backend(&mut self, backend: BackendDescriptor) {
        let ip = backend.ip_address.clone();
        self.backend_ip_map
            .entry(backend.address.hostname.clone())
            .or_insert_with(|| ip.clone());
        self.backend_ip_map
            .entry(ip.clone())
            .or_insert_with(|| ip.clone());
        self.backend_map.entry(ip).or_default().push(backend);
    }

    /// Resolve a hostname (or IP literal) to the IP of a registered backend.
    pub fn lookup_backend_ip(&self, hostname: &str) -> Option<&IpAddr> {
        self.backend_ip_map.get(hostname)
    }

    /// All backends listening on the given IP, in registration order.
    pub fn backends_on_host(&self, ip: &str) -> Option<&[BackendDescriptor]> {
        self.backend_map.get(ip).map(Vec::as_slice)
    }

    /// IPs of all registered backends, sorted for deterministic iteration.
    pub fn all_backend_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.backend_map.keys().cloned().collect();
        ips.sort_unstable();
        ips
    }

    /// Iterate over every registered backend descriptor.
    pub fn iter_backends(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backend_map.values().flatten()
    }

    /// Total number of registered backends (not hosts).
    pub fn num_backends(&self) -> usize {
        self.backend_map.values().map(Vec::len).sum()
    }

    /// Whether the snapshot contains no backends at all.
    pub fn is_empty(&self) -> bool {
        self.backend_map.is_empty()
    }
}
