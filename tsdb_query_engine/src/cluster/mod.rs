// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cluster metadata consumed by the scheduler: the partition map, per-table
//! partitioners, and the replication scheme.
//!
//! Everything in this module is an immutable, read-only view during query execution;
//! shard workers share it without synchronization.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::qtree::ValueExpressionNode;

mod partition;
mod replication;

pub use partition::{PartitionKey, Partitioner, TimeWindowPartitioner};
pub use replication::{HostId, ReplicationScheme, StaticReplicationScheme};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self { columns }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A table's cluster-level configuration: its schema and, for partitioned tables, the
/// partitioner that enumerates its partitions.
pub struct TableConfig {
    name: String,
    description: String,
    schema: TableSchema,
    partitioner: Option<Arc<dyn Partitioner>>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            partitioner: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn partitioner(&self) -> Option<&Arc<dyn Partitioner>> {
        self.partitioner.as_ref()
    }
}

/// The per-namespace table directory.
#[derive(Default)]
pub struct PartitionMap {
    tables: HashMap<String, HashMap<String, Arc<TableConfig>>>,
}

impl PartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, namespace: impl Into<String>, table: TableConfig) {
        self.tables
            .entry(namespace.into())
            .or_default()
            .insert(table.name().to_string(), Arc::new(table));
    }

    pub fn find_table(&self, namespace: &str, table_key: &str) -> Option<Arc<TableConfig>> {
        self.tables.get(namespace)?.get(table_key).cloned()
    }
}

/// The comparison operator of a single scan constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintOp {
    Equal,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl ConstraintOp {
    fn from_function(function: &str) -> Option<Self> {
        match function {
            "eq" => Some(Self::Equal),
            "gt" => Some(Self::GreaterThan),
            "gte" => Some(Self::GreaterThanOrEqual),
            "lt" => Some(Self::LessThan),
            "lte" => Some(Self::LessThanOrEqual),
            _ => None,
        }
    }

    fn mirrored(self) -> Self {
        match self {
            Self::Equal => Self::Equal,
            Self::GreaterThan => Self::LessThan,
            Self::GreaterThanOrEqual => Self::LessThanOrEqual,
            Self::LessThan => Self::GreaterThan,
            Self::LessThanOrEqual => Self::GreaterThanOrEqual,
        }
    }
}

/// A column-vs-literal comparison lifted from a scan's WHERE expression, handed to the
/// partitioner for partition pruning.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanConstraint {
    pub column: String,
    pub op: ConstraintOp,
    pub value: Value,
}

/// Extracts scan constraints from a WHERE expression.
///
/// Only top-level conjunctions contribute: `logical_and` recurses, and comparison calls
/// of a column against a literal become constraints (in either argument order).
/// Everything else is ignored; constraints are an optimization, the full WHERE
/// expression is still evaluated by the scan.
pub fn scan_constraints(where_expression: Option<&ValueExpressionNode>) -> Vec<ScanConstraint> {
    let mut constraints = Vec::new();
    if let Some(expression) = where_expression {
        collect_constraints(expression, &mut constraints);
    }
    constraints
}

fn collect_constraints(expression: &ValueExpressionNode, constraints: &mut Vec<ScanConstraint>) {
    let ValueExpressionNode::Call { function, args } = expression else {
        return;
    };

    if function == "logical_and" {
        for arg in args {
            collect_constraints(arg, constraints);
        }
        return;
    }

    let Some(op) = ConstraintOp::from_function(function) else {
        return;
    };

    match &args[..] {
        [ValueExpressionNode::ColumnReference(column), ValueExpressionNode::Literal(value)] => {
            constraints.push(ScanConstraint {
                column: column.clone(),
                op,
                value: value.clone(),
            });
        }
        [ValueExpressionNode::Literal(value), ValueExpressionNode::ColumnReference(column)] => {
            constraints.push(ScanConstraint {
                column: column.clone(),
                op: op.mirrored(),
                value: value.clone(),
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_conjunctive_comparisons() {
        let expression = ValueExpressionNode::call(
            "logical_and",
            vec![
                ValueExpressionNode::call(
                    "gte",
                    vec![
                        ValueExpressionNode::column("time"),
                        ValueExpressionNode::literal(100),
                    ],
                ),
                ValueExpressionNode::call(
                    "lte",
                    vec![
                        ValueExpressionNode::column("time"),
                        ValueExpressionNode::literal(200),
                    ],
                ),
            ],
        );

        assert_eq!(
            scan_constraints(Some(&expression)),
            vec![
                ScanConstraint {
                    column: "time".to_string(),
                    op: ConstraintOp::GreaterThanOrEqual,
                    value: json!(100),
                },
                ScanConstraint {
                    column: "time".to_string(),
                    op: ConstraintOp::LessThanOrEqual,
                    value: json!(200),
                },
            ]
        );
    }

    #[test]
    fn mirrors_literal_first_comparisons() {
        let expression = ValueExpressionNode::call(
            "lt",
            vec![
                ValueExpressionNode::literal(100),
                ValueExpressionNode::column("time"),
            ],
        );

        assert_eq!(
            scan_constraints(Some(&expression)),
            vec![ScanConstraint {
                column: "time".to_string(),
                op: ConstraintOp::GreaterThan,
                value: json!(100),
            }]
        );
    }

    #[test]
    fn disjunctions_contribute_nothing() {
        let expression = ValueExpressionNode::call(
            "logical_or",
            vec![
                ValueExpressionNode::call(
                    "gte",
                    vec![
                        ValueExpressionNode::column("time"),
                        ValueExpressionNode::literal(100),
                    ],
                ),
                ValueExpressionNode::call(
                    "lte",
                    vec![
                        ValueExpressionNode::column("time"),
                        ValueExpressionNode::literal(200),
                    ],
                ),
            ],
        );

        assert_eq!(scan_constraints(Some(&expression)), Vec::new());
    }
}
