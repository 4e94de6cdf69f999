// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Executable table expressions.
//!
//! The scheduler compiles a logical query tree into a tree of table expressions. Each
//! expression exclusively owns its children and streams rows to its parent through a
//! pull-based, asynchronous [`next`](TableExpression::next): the engine never blocks a
//! thread itself, it suspends and is driven by whatever executor the caller awaits the
//! [`ResultCursor`] on. The cursor owns the root; dropping it tears the whole pipeline
//! down, cancelling any in-flight shards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::txn::ExecutionContext;

pub mod aggregate;
pub mod group_by;
pub mod meta;
pub mod pipelined;
pub mod relational;

pub use group_by::{GroupByExpression, GroupByMergeExpression, PartialGroupByExpression};
pub use meta::{ChartExpression, DescribeTableExpression, ShowTablesExpression};
pub use pipelined::{PipelinedExpression, RemoteShardRequest, ShardResponse, ShardTransport};
pub use relational::{
    LimitExpression, NestedLoopJoin, OrderByExpression, SelectExpression, SubqueryExpression,
};

/// The ordered column names of a row stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowSchema {
    columns: Vec<String>,
}

impl RowSchema {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// A single row: a schema shared with its siblings, and one value per column.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    schema: Arc<RowSchema>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(schema: Arc<RowSchema>, values: Vec<Value>) -> Self {
        debug_assert_eq!(schema.len(), values.len(), "row width must match its schema");
        Self { schema, values }
    }

    pub fn empty() -> Self {
        Self {
            schema: RowSchema::empty(),
            values: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        let index = self.schema.index_of(column)?;
        self.values.get(index)
    }
}

/// A node of the executable operator tree.
///
/// Pulling is asynchronous so that expressions backed by storage or remote I/O compose
/// with the embedding server's own executor; pure-compute expressions simply never
/// suspend.
#[async_trait]
pub trait TableExpression: Send {
    /// Pulls the next row, or `None` once the stream is exhausted. After an error or
    /// `None`, the expression must not be polled again.
    async fn next(&mut self) -> crate::Result<Option<Row>>;
}

/// Decrements a running-statement counter when dropped.
///
/// The scheduler increments its counter on execution entry and hands the guard to the
/// cursor, so the count falls back when the caller finishes (or abandons) the stream.
pub struct RunningGuard {
    counter: Arc<AtomicUsize>,
}

impl RunningGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Streams the rows of an executed statement to the caller, who awaits it on their own
/// executor.
pub struct ResultCursor {
    root: Box<dyn TableExpression>,
    ectx: Arc<ExecutionContext>,
    _running: RunningGuard,
}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor").finish_non_exhaustive()
    }
}

impl ResultCursor {
    pub fn new(
        root: Box<dyn TableExpression>,
        ectx: Arc<ExecutionContext>,
        running: RunningGuard,
    ) -> Self {
        Self {
            root,
            ectx,
            _running: running,
        }
    }

    pub async fn next(&mut self) -> crate::Result<Option<Row>> {
        self.root.next().await
    }

    /// Drains the remaining rows into a vector.
    pub async fn drain(&mut self) -> crate::Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn execution_context(&self) -> &Arc<ExecutionContext> {
        &self.ectx
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        // Anything still running behind this cursor is abandoned work.
        self.ectx.cancel();
    }
}

/// A fixed row set, used by provider scans and literal expressions.
pub struct VecRowsExpression {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowsExpression {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl TableExpression for VecRowsExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        Ok(self.rows.next())
    }
}
