// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The plan splitter: clones a pipelineable subtree once per partition, rewriting each
//! copy's scan to address exactly one partition.

use crate::cluster::{scan_constraints, HostId};
use crate::qtree::{QueryTreeNode, TableRef};
use crate::txn::Transaction;
use crate::ErrorKind;

use super::Scheduler;

/// One per-partition clone of a pipelineable subtree.
#[derive(Debug)]
pub struct PipelinedShard {
    /// Whether a replica of the shard's partition is hosted on this coordinator. Local
    /// shards execute in-process and never retry.
    pub is_local: bool,
    /// The cloned subtree; its scan addresses the shard's partition via a
    /// `tsdb://localhost/..` reference.
    pub qtree: QueryTreeNode,
    /// Candidate replica hosts, in dispatch preference order.
    pub hosts: Vec<HostId>,
}

impl Scheduler {
    /// Splits a pipelineable subtree into one shard per partition of the scanned table.
    ///
    /// The subtree must contain exactly one sequential scan, and that scan must not
    /// already address a specific partition; both are planning invariants, violated only
    /// by a bug upstream.
    pub fn pipeline_expression(
        &self,
        txn: &Transaction,
        qtree: &QueryTreeNode,
    ) -> crate::Result<Vec<PipelinedShard>> {
        let scans = qtree.sequential_scans();
        let [scan] = scans.as_slice() else {
            return Err(ErrorKind::IllegalState.with_message(format!(
                "can't pipeline query tree: expected exactly one sequential scan, found {}",
                scans.len()
            )));
        };

        let table_ref = TableRef::parse(scan.table_name())?;
        if table_ref.partition_key.is_some() {
            return Err(ErrorKind::IllegalState
                .with_message("can't pipeline query tree: scan is already partition-addressed"));
        }

        if txn.user_context().is_none() {
            return Err(ErrorKind::RuntimeError.with_message("no user data"));
        }

        let table = self
            .pmap
            .find_table(txn.namespace(), &table_ref.table_key)
            .ok_or_else(|| {
                ErrorKind::TableNotFound
                    .with_message(format!("table not found: {}", table_ref.table_key))
            })?;

        let partitioner = table.partitioner().ok_or_else(|| {
            ErrorKind::IllegalState
                .with_message(format!("table {} has no partitioner", table_ref.table_key))
        })?;

        let constraints = scan_constraints(scan.where_expression());
        let partitions = partitioner.list_partitions(&constraints)?;

        let mut shards = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let mut qtree_copy = qtree.deep_copy();
            let shard_scan = qtree_copy.first_sequential_scan_mut().ok_or_else(|| {
                ErrorKind::IllegalState.with_message("deep copy lost the sequential scan")
            })?;
            shard_scan.set_table_name(TableRef::partition_uri(&table_ref.table_key, &partition));

            shards.push(PipelinedShard {
                is_local: self.repl_scheme.has_local_replica(&partition),
                qtree: qtree_copy,
                hosts: self.repl_scheme.replicas_for(&partition),
            });
        }

        tracing::debug!(
            table = %table_ref.table_key,
            shards = shards.len(),
            local = shards.iter().filter(|s| s.is_local).count(),
            "pipelined query tree"
        );
        Ok(shards)
    }
}
