// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::{self, Display};

use super::PartitionKey;

/// Identifies a host in the cluster, by its RPC address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostId {
    addr: String,
}

impl HostId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Maps partitions to the hosts that carry their replicas.
///
/// The replica list is ordered by dispatch preference: the pipelined executor tries
/// hosts front to back when a transport attempt fails. Shared read-only across shard
/// workers.
pub trait ReplicationScheme: Send + Sync {
    fn replicas_for(&self, partition: &PartitionKey) -> Vec<HostId>;

    /// Whether one of the partition's replicas is hosted on this coordinator.
    fn has_local_replica(&self, partition: &PartitionKey) -> bool;
}

/// A replication scheme backed by an explicit partition-to-hosts assignment, as
/// distributed by the cluster coordinator.
pub struct StaticReplicationScheme {
    local_host: HostId,
    replicas: HashMap<PartitionKey, Vec<HostId>>,
}

impl StaticReplicationScheme {
    pub fn new(local_host: HostId) -> Self {
        Self {
            local_host,
            replicas: HashMap::new(),
        }
    }

    pub fn local_host(&self) -> &HostId {
        &self.local_host
    }

    pub fn assign(&mut self, partition: PartitionKey, hosts: Vec<HostId>) {
        self.replicas.insert(partition, hosts);
    }
}

impl ReplicationScheme for StaticReplicationScheme {
    fn replicas_for(&self, partition: &PartitionKey) -> Vec<HostId> {
        self.replicas.get(partition).cloned().unwrap_or_default()
    }

    fn has_local_replica(&self, partition: &PartitionKey) -> bool {
        self.replicas
            .get(partition)
            .map(|hosts| hosts.contains(&self.local_host))
            .unwrap_or(false)
    }
}
