//! AddressTable: where each process can be reached.
//!
//! Supplied by whoever provisions the deployment and never changed afterwards.
//! In the usual deployment every process listens on the same service port,
//! so the table is built from host addresses plus that port.

use crate::ProcessId;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Default service port shared by every process of a deployment.
pub const DEFAULT_SERVICE_PORT: u16 = 3210;

/// Immutable mapping from process ID to network address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    by_id: BTreeMap<ProcessId, SocketAddr>,
}

impl AddressTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, builder style. A later entry for the same ID replaces the earlier one.
    pub fn insert(mut self, id: ProcessId, addr: SocketAddr) -> Self {
        self.by_id.insert(id, addr);
        self
    }

    /// Build a table where every process listens on `service_port`.
    pub fn from_hosts(
        hosts: impl IntoIterator<Item = (ProcessId, IpAddr)>,
        service_port: u16,
    ) -> Self {
        hosts
            .into_iter()
            .map(|(id, ip)| (id, SocketAddr::new(ip, service_port)))
            .collect()
    }

    /// Look up the address of a process.
    pub fn get(&self, id: &ProcessId) -> Option<SocketAddr> {
        self.by_id.get(id).copied()
    }

    /// Check whether a process is known.
    pub fn contains(&self, id: &ProcessId) -> bool {
        self.by_id.contains_key(id)
    }

    /// All known process IDs, in order.
    pub fn ids(&self) -> impl Iterator<Item = &ProcessId> {
        self.by_id.keys()
    }

    /// Number of known processes.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Identify a process from the source IP of a connection.
    ///
    /// Returns `None` when no process or more than one process lives at that IP,
    /// since guessing would let the link attribute a message to the wrong sender.
    pub fn resolve_ip(&self, ip: IpAddr) -> Option<&ProcessId> {
        let mut matches = self
            .by_id
            .iter()
            .filter(|(_, addr)| addr.ip() == ip)
            .map(|(id, _)| id);
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }
}

impl FromIterator<(ProcessId, SocketAddr)> for AddressTable {
    fn from_iter<I: IntoIterator<Item = (ProcessId, SocketAddr)>>(iter: I) -> Self {
        Self {
            by_id: iter.into_iter().collect(),
        }
    }
}
