// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated cluster for exercising the scheduler end-to-end.
//!
//! The simulation keeps the real scheduler on every node: the coordinator plans and
//! splits queries exactly as in production, and each "remote" host runs the shard
//! request through its own scheduler instance against an in-memory table provider
//! holding only the partitions that host carries. Only the RPC transport is faked, with
//! per-host failure injection and a dispatch log for assertions.

// Every test binary compiles its own copy of this module and uses a different subset.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use tsdb_query_engine::cluster::{
    ColumnSchema, HostId, PartitionKey, PartitionMap, StaticReplicationScheme, TableConfig,
    TableSchema, TimeWindowPartitioner,
};
use tsdb_query_engine::config::SchedulerConfig;
use tsdb_query_engine::exec::{
    RemoteShardRequest, Row, RowSchema, ShardResponse, ShardTransport, SubqueryExpression,
    TableExpression, VecRowsExpression,
};
use tsdb_query_engine::expr::DefaultCompiler;
use tsdb_query_engine::qtree::{QueryTreeNode, SequentialScanNode, TableRef};
use tsdb_query_engine::scheduler::Scheduler;
use tsdb_query_engine::txn::{
    ClusterAuth, ExecutionContext, QueryPlan, TableListEntry, TableProvider, Transaction,
    UserContext,
};
use tsdb_query_engine::ErrorKind;

pub const AUTH_TOKEN: &str = "internal-secret";
pub const NAMESPACE: &str = "testns";

/// An in-memory table, partitioned by time window. Partitions are keyed by window
/// start so bare-table scans iterate in time order.
pub struct MemoryTable {
    pub schema: TableSchema,
    pub partitions: BTreeMap<i64, (PartitionKey, Vec<Vec<Value>>)>,
}

/// Serves scans from in-memory tables. Bare table references scan every partition the
/// provider holds; partition-addressed references scan exactly that partition.
#[derive(Default)]
pub struct MemoryTableProvider {
    tables: HashMap<String, MemoryTable>,
}

impl MemoryTableProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, name: impl Into<String>, table: MemoryTable) {
        self.tables.insert(name.into(), table);
    }
}

impl TableProvider for MemoryTableProvider {
    fn build_sequential_scan(
        &self,
        txn: &Transaction,
        ectx: &Arc<ExecutionContext>,
        node: &SequentialScanNode,
    ) -> tsdb_query_engine::Result<Option<Box<dyn TableExpression>>> {
        let table_ref = TableRef::parse(node.table_name())?;
        let Some(table) = self.tables.get(&table_ref.table_key) else {
            return Ok(None);
        };

        let raw: Vec<Vec<Value>> = match table_ref.partition_key {
            Some(partition) => table
                .partitions
                .values()
                .find(|(key, _)| *key == partition)
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default(),
            None => table
                .partitions
                .values()
                .flat_map(|(_, rows)| rows.clone())
                .collect(),
        };
        ectx.record_rows_scanned(raw.len() as u64);

        let schema = Arc::new(RowSchema::new(table.schema.column_names()));
        let rows = raw
            .into_iter()
            .map(|values| Row::new(schema.clone(), values))
            .collect();

        let select = node
            .select_list
            .iter()
            .map(|item| {
                let expression = txn.compiler().build_value_expression(txn, &item.expression)?;
                Ok((item.column_name(), expression))
            })
            .collect::<tsdb_query_engine::Result<Vec<_>>>()?;
        let where_expression = node
            .where_expression()
            .map(|e| txn.compiler().build_value_expression(txn, e))
            .transpose()?;

        Ok(Some(Box::new(SubqueryExpression::new(
            select,
            where_expression,
            Box::new(VecRowsExpression::new(rows)),
        ))))
    }

    fn list_tables(&self) -> Vec<TableListEntry> {
        self.tables
            .keys()
            .map(|name| TableListEntry {
                name: name.clone(),
                description: String::new(),
            })
            .collect()
    }

    fn describe_table(&self, table_key: &str) -> Option<TableSchema> {
        self.tables.get(table_key).map(|table| table.schema.clone())
    }
}

/// One dispatch attempt observed by the mock transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub host: String,
    pub scan_target: String,
}

struct RemoteNode {
    scheduler: Scheduler,
    provider: Arc<MemoryTableProvider>,
}

impl RemoteNode {
    fn new(host: &str, provider: Arc<MemoryTableProvider>) -> Self {
        // Shard queries are already partition-addressed, so the remote scheduler never
        // consults its partition map or fans out further.
        let scheduler = Scheduler::new(
            Arc::new(PartitionMap::new()),
            Arc::new(ClusterAuth::new(AUTH_TOKEN)),
            Arc::new(StaticReplicationScheme::new(HostId::new(host))),
            Arc::new(DeadEndTransport),
            SchedulerConfig::default(),
        );
        Self {
            scheduler,
            provider,
        }
    }

    async fn execute(
        &self,
        request: RemoteShardRequest,
    ) -> tsdb_query_engine::Result<ShardResponse> {
        let txn = Arc::new(
            Transaction::new(
                request.namespace.clone(),
                Arc::new(DefaultCompiler::new()),
                self.provider.clone(),
            )
            .with_user(UserContext::new("cluster")),
        );
        let plan = QueryPlan::new(txn, vec![request.qtree]);
        let mut cursor = self.scheduler.execute(&plan, 0)?;
        Ok(ShardResponse::from_rows(cursor.drain().await?))
    }
}

struct DeadEndTransport;

#[async_trait]
impl ShardTransport for DeadEndTransport {
    async fn execute(
        &self,
        host: &HostId,
        _request: RemoteShardRequest,
    ) -> tsdb_query_engine::Result<ShardResponse> {
        Err(ErrorKind::ShardDispatchFailed.with_message(format!("no route to {host}")))
    }
}

/// The faked RPC layer: routes requests to per-host remote nodes, with failure
/// injection and a dispatch log.
pub struct MockTransport {
    nodes: HashMap<String, RemoteNode>,
    failures: Mutex<HashMap<String, usize>>,
    log: Mutex<Vec<DispatchRecord>>,
}

impl MockTransport {
    fn new(nodes: HashMap<String, RemoteNode>) -> Self {
        Self {
            nodes,
            failures: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` dispatches to `host` fail at the transport level.
    pub fn fail_next(&self, host: &str, count: usize) {
        self.failures.lock().unwrap().insert(host.to_string(), count);
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardTransport for MockTransport {
    async fn execute(
        &self,
        host: &HostId,
        request: RemoteShardRequest,
    ) -> tsdb_query_engine::Result<ShardResponse> {
        let scan_target = request
            .qtree
            .sequential_scans()
            .first()
            .map(|scan| scan.table_name().to_string())
            .unwrap_or_default();
        self.log.lock().unwrap().push(DispatchRecord {
            host: host.addr().to_string(),
            scan_target,
        });

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(host.addr()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ErrorKind::ShardDispatchFailed
                    .with_message(format!("connection refused: {host}")));
            }
        }

        if request.auth_token != AUTH_TOKEN {
            return Err(ErrorKind::RuntimeError.with_message("authentication failed"));
        }

        let Some(node) = self.nodes.get(host.addr()) else {
            return Err(
                ErrorKind::ShardDispatchFailed.with_message(format!("unknown host: {host}"))
            );
        };
        node.execute(request).await
    }
}

/// Declares one partition of a test table: its time window, its replica hosts in
/// preference order, and the rows it holds.
pub struct PartitionSpec {
    pub window_start: i64,
    pub hosts: Vec<&'static str>,
    pub rows: Vec<Vec<Value>>,
}

pub struct TableSpec {
    pub name: &'static str,
    pub schema: TableSchema,
    pub window_micros: i64,
    pub partitions: Vec<PartitionSpec>,
    /// Hosts that are assigned replicas of this table but do not actually serve it,
    /// for simulating partition-map drift.
    pub absent_on: Vec<&'static str>,
}

pub struct TestCluster {
    pub scheduler: Scheduler,
    pub transport: Arc<MockTransport>,
    pub transaction: Arc<Transaction>,
    partitioners: HashMap<String, Arc<TimeWindowPartitioner>>,
}

impl TestCluster {
    pub fn plan(&self, statement: QueryTreeNode) -> QueryPlan {
        QueryPlan::new(self.transaction.clone(), vec![statement])
    }

    pub fn partition_key(&self, table: &str, window_start: i64) -> PartitionKey {
        self.partitioners[table].partition_key_for(window_start)
    }
}

pub const LOCAL_HOST: &str = "local:7001";

/// Builds a cluster from table specs. Rows of a partition are stored on every replica
/// host (including the coordinator, when it is a replica).
pub fn build_cluster(tables: Vec<TableSpec>) -> TestCluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let mut pmap = PartitionMap::new();
    let mut repl = StaticReplicationScheme::new(HostId::new(LOCAL_HOST));
    let mut partitioners = HashMap::new();

    // Providers by host; the coordinator's provider is under LOCAL_HOST.
    let mut providers: HashMap<String, MemoryTableProvider> = HashMap::new();

    for table in &tables {
        let active_limit = table
            .partitions
            .iter()
            .map(|p| p.window_start + table.window_micros - 1)
            .max()
            .unwrap_or(0);
        let partitioner = Arc::new(
            TimeWindowPartitioner::new(table.name, table.window_micros, 0, active_limit).unwrap(),
        );
        partitioners.insert(table.name.to_string(), partitioner.clone());

        pmap.add_table(
            NAMESPACE,
            TableConfig::new(table.name, table.schema.clone()).with_partitioner(partitioner.clone()),
        );

        for partition in &table.partitions {
            let key = partitioner.partition_key_for(partition.window_start);
            repl.assign(key, partition.hosts.iter().map(|h| HostId::new(*h)).collect());

            for host in &partition.hosts {
                let provider = providers.entry(host.to_string()).or_default();
                if table.absent_on.contains(host) {
                    continue;
                }
                let entry = provider
                    .tables
                    .entry(table.name.to_string())
                    .or_insert_with(|| MemoryTable {
                        schema: table.schema.clone(),
                        partitions: BTreeMap::new(),
                    });
                entry
                    .partitions
                    .insert(partition.window_start, (key, partition.rows.clone()));
            }
        }
    }

    let local_provider = Arc::new(providers.remove(LOCAL_HOST).unwrap_or_default());
    let nodes = providers
        .into_iter()
        .map(|(host, provider)| {
            let node = RemoteNode::new(&host, Arc::new(provider));
            (host, node)
        })
        .collect();
    let transport = Arc::new(MockTransport::new(nodes));

    let scheduler = Scheduler::new(
        Arc::new(pmap),
        Arc::new(ClusterAuth::new(AUTH_TOKEN)),
        Arc::new(repl),
        transport.clone(),
        SchedulerConfig::default(),
    );

    let transaction = Arc::new(
        Transaction::new(NAMESPACE, Arc::new(DefaultCompiler::new()), local_provider)
            .with_user(UserContext::new("root")),
    );

    TestCluster {
        scheduler,
        transport,
        transaction,
        partitioners,
    }
}

/// Standard schema for event tables in these tests: a timestamp and a value.
pub fn events_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::new("time", "uint64", false),
        ColumnSchema::new("value", "uint64", true),
    ])
}

/// Rows for [`events_schema`] tables.
pub fn event_rows(rows: &[(i64, i64)]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|(time, value)| vec![Value::from(*time), Value::from(*value)])
        .collect()
}
