// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transaction context handed to the scheduler by the planner.
//!
//! The transaction itself is an immutable handle shared across shard workers. Mutable
//! per-statement state (cancellation, scan counters) lives in [`ExecutionContext`],
//! which is created per `execute` call and threaded through the built expression tree.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cluster::TableSchema;
use crate::exec::TableExpression;
use crate::expr::QueryCompiler;
use crate::qtree::{QueryTreeNode, SequentialScanNode};
use crate::ErrorKind;

/// The authenticated user a statement runs as. Remote shard fan-out requires one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    userid: String,
}

impl UserContext {
    pub fn new(userid: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
        }
    }

    pub fn userid(&self) -> &str {
        &self.userid
    }
}

/// Cluster-internal credentials attached to every remote shard dispatch.
pub struct ClusterAuth {
    token: String,
}

impl ClusterAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct Transaction {
    namespace: String,
    user: Option<UserContext>,
    compiler: Arc<dyn QueryCompiler>,
    table_provider: Arc<dyn TableProvider>,
}

impl Transaction {
    pub fn new(
        namespace: impl Into<String>,
        compiler: Arc<dyn QueryCompiler>,
        table_provider: Arc<dyn TableProvider>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            user: None,
            compiler,
            table_provider,
        }
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    /// The tenant this transaction operates in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn user_context(&self) -> Option<&UserContext> {
        self.user.as_ref()
    }

    pub fn compiler(&self) -> &dyn QueryCompiler {
        &*self.compiler
    }

    pub fn table_provider(&self) -> &dyn TableProvider {
        &*self.table_provider
    }
}

/// An entry in the `SHOW TABLES` listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableListEntry {
    pub name: String,
    pub description: String,
}

/// The seam to the physical storage engine.
///
/// The scheduler never reads storage itself: sequential scans are built by the provider,
/// which owns projection and filtering over its own format. A provider on a data node
/// also resolves partition-addressed references (`tsdb://..`) produced by the plan
/// splitter.
pub trait TableProvider: Send + Sync {
    /// Builds the executable scan for a sequential-scan node, or `None` if the table is
    /// not served by this provider.
    fn build_sequential_scan(
        &self,
        txn: &Transaction,
        ectx: &Arc<ExecutionContext>,
        node: &SequentialScanNode,
    ) -> crate::Result<Option<Box<dyn TableExpression>>>;

    fn list_tables(&self) -> Vec<TableListEntry>;

    fn describe_table(&self, table_key: &str) -> Option<TableSchema>;
}

/// A planned query: one transaction, one or more statements.
pub struct QueryPlan {
    transaction: Arc<Transaction>,
    statements: Vec<QueryTreeNode>,
}

impl QueryPlan {
    pub fn new(transaction: Arc<Transaction>, statements: Vec<QueryTreeNode>) -> Self {
        Self {
            transaction,
            statements,
        }
    }

    pub fn num_statements(&self) -> usize {
        self.statements.len()
    }

    pub fn statement(&self, idx: usize) -> crate::Result<&QueryTreeNode> {
        self.statements.get(idx).ok_or_else(|| {
            ErrorKind::RuntimeError.with_message(format!("no statement at index {idx}"))
        })
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }
}

/// Mutable per-statement execution state.
///
/// Shared by the cursor, the pipelined executor, and the storage provider; everything on
/// it is atomic, so shard workers touch it freely.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    cancelled: AtomicBool,
    rows_scanned: AtomicU64,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Set by the cursor on drop and by the pipelined executor
    /// when a peer shard fails.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn record_rows_scanned(&self, count: u64) {
        self.rows_scanned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn rows_scanned(&self) -> u64 {
        self.rows_scanned.load(Ordering::Relaxed)
    }
}

/// A transaction over the default compiler and an empty table provider, for unit tests.
#[cfg(test)]
pub(crate) fn test_transaction() -> Transaction {
    struct NoTables;

    impl TableProvider for NoTables {
        fn build_sequential_scan(
            &self,
            _txn: &Transaction,
            _ectx: &Arc<ExecutionContext>,
            _node: &SequentialScanNode,
        ) -> crate::Result<Option<Box<dyn TableExpression>>> {
            Ok(None)
        }

        fn list_tables(&self) -> Vec<TableListEntry> {
            Vec::new()
        }

        fn describe_table(&self, _table_key: &str) -> Option<TableSchema> {
            None
        }
    }

    Transaction::new(
        "test",
        Arc::new(crate::expr::DefaultCompiler::new()),
        Arc::new(NoTables),
    )
    .with_user(UserContext::new("test"))
}
