// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Display};

use sha1::{Digest, Sha1};

use crate::ErrorKind;

use super::{ConstraintOp, ScanConstraint};

/// A 160-bit partition identifier.
///
/// Partition keys are derived from the table's partitioner (for time-partitioned tables,
/// a SHA-1 over the table key and the window start), rendered as lowercase hex in
/// partition-addressed scan URIs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey([u8; 20]);

impl PartitionKey {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Derives a partition key as the SHA-1 digest of the given parts.
    pub fn digest_of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ErrorKind::RuntimeError.with_source(e))?;
        let bytes: [u8; Self::LEN] = bytes.try_into().map_err(|_| {
            ErrorKind::RuntimeError.with_message("partition key must be 160 bits")
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PartitionKey({self})")
    }
}

/// Enumerates the partitions a scan has to visit.
///
/// The returned order is deterministic and reflects the table's partitioning (time order
/// for time-partitioned tables). Implementations prune partitions that the scan
/// constraints exclude.
pub trait Partitioner: Send + Sync {
    fn list_partitions(&self, constraints: &[ScanConstraint]) -> crate::Result<Vec<PartitionKey>>;
}

/// Partitions a table into fixed-width time windows.
///
/// Window `n` covers `[n * window_micros, (n + 1) * window_micros)`. The active range is
/// the span of windows that currently hold data; it is maintained by the cluster
/// coordinator as data arrives and expires.
pub struct TimeWindowPartitioner {
    table_key: String,
    window_micros: i64,
    active_begin: i64,
    active_limit: i64,
}

impl TimeWindowPartitioner {
    pub fn new(
        table_key: impl Into<String>,
        window_micros: i64,
        active_begin: i64,
        active_limit: i64,
    ) -> crate::Result<Self> {
        if window_micros <= 0 {
            return Err(ErrorKind::IllegalState.with_message("partition window must be positive"));
        }
        if active_begin > active_limit {
            return Err(ErrorKind::IllegalState.with_message("partition range is inverted"));
        }
        Ok(Self {
            table_key: table_key.into(),
            window_micros,
            active_begin,
            active_limit,
        })
    }

    /// The partition key of the window starting at `window_start`.
    pub fn partition_key_for(&self, window_start: i64) -> PartitionKey {
        PartitionKey::digest_of(&[
            self.table_key.as_bytes(),
            b"\0",
            &window_start.to_be_bytes(),
        ])
    }

    fn window_start(&self, time: i64) -> i64 {
        time.div_euclid(self.window_micros) * self.window_micros
    }

    /// Narrows the active range by any `time` constraints on the scan.
    fn time_bounds(&self, constraints: &[ScanConstraint]) -> (i64, i64) {
        let mut lo = self.active_begin;
        let mut hi = self.active_limit;
        for constraint in constraints {
            if constraint.column != "time" {
                continue;
            }
            let Some(time) = constraint.value.as_i64() else {
                continue;
            };
            match constraint.op {
                ConstraintOp::GreaterThanOrEqual => lo = lo.max(time),
                ConstraintOp::GreaterThan => lo = lo.max(time + 1),
                ConstraintOp::LessThanOrEqual => hi = hi.min(time),
                ConstraintOp::LessThan => hi = hi.min(time - 1),
                ConstraintOp::Equal => {
                    lo = lo.max(time);
                    hi = hi.min(time);
                }
            }
        }
        (lo, hi)
    }
}

impl Partitioner for TimeWindowPartitioner {
    fn list_partitions(&self, constraints: &[ScanConstraint]) -> crate::Result<Vec<PartitionKey>> {
        let (lo, hi) = self.time_bounds(constraints);
        if lo > hi {
            return Ok(Vec::new());
        }

        let mut partitions = Vec::new();
        let mut window_start = self.window_start(lo);
        while window_start <= hi {
            partitions.push(self.partition_key_for(window_start));
            window_start += self.window_micros;
        }
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn constraint(op: ConstraintOp, time: i64) -> ScanConstraint {
        ScanConstraint {
            column: "time".to_string(),
            op,
            value: json!(time),
        }
    }

    #[test]
    fn enumerates_all_windows_without_constraints() {
        let partitioner = TimeWindowPartitioner::new("events", 100, 0, 299).unwrap();
        let partitions = partitioner.list_partitions(&[]).unwrap();
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[0], partitioner.partition_key_for(0));
        assert_eq!(partitions[2], partitioner.partition_key_for(200));
    }

    #[test]
    fn partition_order_is_deterministic() {
        let partitioner = TimeWindowPartitioner::new("events", 100, 0, 299).unwrap();
        assert_eq!(
            partitioner.list_partitions(&[]).unwrap(),
            partitioner.list_partitions(&[]).unwrap()
        );
    }

    #[test]
    fn prunes_windows_outside_time_constraints() {
        let partitioner = TimeWindowPartitioner::new("events", 100, 0, 999).unwrap();
        let partitions = partitioner
            .list_partitions(&[
                constraint(ConstraintOp::GreaterThanOrEqual, 250),
                constraint(ConstraintOp::LessThanOrEqual, 420),
            ])
            .unwrap();

        // Windows [200, 300), [300, 400) and [400, 500) overlap the constrained range.
        assert_eq!(
            partitions,
            vec![
                partitioner.partition_key_for(200),
                partitioner.partition_key_for(300),
                partitioner.partition_key_for(400),
            ]
        );
    }

    #[test]
    fn disjoint_constraints_produce_no_partitions() {
        let partitioner = TimeWindowPartitioner::new("events", 100, 0, 999).unwrap();
        let partitions = partitioner
            .list_partitions(&[
                constraint(ConstraintOp::GreaterThan, 500),
                constraint(ConstraintOp::LessThan, 400),
            ])
            .unwrap();
        assert_eq!(partitions, Vec::new());
    }

    #[test]
    fn keys_differ_across_tables_and_windows() {
        let a = TimeWindowPartitioner::new("a", 100, 0, 99).unwrap();
        let b = TimeWindowPartitioner::new("b", 100, 0, 99).unwrap();
        assert_ne!(a.partition_key_for(0), b.partition_key_for(0));
        assert_ne!(a.partition_key_for(0), a.partition_key_for(100));
    }

    #[test]
    fn partition_keys_roundtrip_hex() {
        let key = PartitionKey::digest_of(&[b"events", b"\0", &0i64.to_be_bytes()]);
        assert_eq!(PartitionKey::from_hex(&key.to_string()).unwrap(), key);
    }
}
