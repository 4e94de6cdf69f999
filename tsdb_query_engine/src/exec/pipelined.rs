// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coordinated execution of pipelined shards.
//!
//! A [`PipelinedExpression`] owns the local partial expressions of a split aggregation
//! and holds descriptors (query tree + replica host list) for the remote ones. When the
//! parent merge operator starts pulling, shards are dispatched with bounded concurrency;
//! completed shard batches are streamed upward in completion order.
//!
//! Remote dispatch goes through the [`ShardTransport`] seam. A transport-level failure
//! moves the shard to its next replica host; exhausting the host list surfaces a
//! shard-level error. Any shard error cancels the peers: the dispatch stream is dropped,
//! which aborts in-flight futures, and the execution context is flagged so the remote
//! side can notice the closed channel.
//!
//! Backpressure falls out of the pull model: new shard futures are only polled while the
//! merge operator is draining rows. The expression never blocks a thread of its own; the
//! dispatch stream is polled through [`TableExpression::next`], so it runs on whatever
//! executor the caller awaits the result cursor on.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cluster::HostId;
use crate::qtree::QueryTreeNode;
use crate::txn::{ClusterAuth, ExecutionContext};
use crate::ErrorKind;

use super::{Row, RowSchema, TableExpression};

/// A partial query dispatched to one replica of a partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteShardRequest {
    pub query_id: Uuid,
    pub namespace: String,
    pub auth_token: String,
    pub qtree: QueryTreeNode,
}

/// The rows a shard produced, in wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ShardResponse {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|row| row.schema().columns().to_vec())
            .unwrap_or_default();
        Self {
            columns,
            rows: rows.into_iter().map(Row::into_values).collect(),
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        let schema = Arc::new(RowSchema::new(self.columns));
        self.rows
            .into_iter()
            .map(|values| Row::new(schema.clone(), values))
            .collect()
    }
}

/// The RPC seam used to run a shard's partial query on a replica host.
///
/// The engine is executor-agnostic; implementations bring their own I/O. A failed
/// attempt is reported as [`ErrorKind::ShardDispatchFailed`], which makes the executor
/// try the next replica; any other error kind is considered fatal for the whole query.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn execute(
        &self,
        host: &HostId,
        request: RemoteShardRequest,
    ) -> crate::Result<ShardResponse>;
}

enum ShardQuery {
    Local(Box<dyn TableExpression>),
    Remote {
        qtree: QueryTreeNode,
        hosts: Vec<HostId>,
    },
}

pub struct PipelinedExpression {
    query_id: Uuid,
    namespace: String,
    auth: Arc<ClusterAuth>,
    transport: Arc<dyn ShardTransport>,
    max_concurrency: usize,
    ectx: Arc<ExecutionContext>,
    pending: Vec<ShardQuery>,
    running: Option<BoxStream<'static, crate::Result<Vec<Row>>>>,
    buffered: VecDeque<Row>,
    done: bool,
}

impl PipelinedExpression {
    pub fn new(
        namespace: impl Into<String>,
        auth: Arc<ClusterAuth>,
        transport: Arc<dyn ShardTransport>,
        max_concurrency: usize,
        ectx: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            namespace: namespace.into(),
            auth,
            transport,
            max_concurrency,
            ectx,
            pending: Vec::new(),
            running: None,
            buffered: VecDeque::new(),
            done: false,
        }
    }

    /// Adds a shard executed in-process. The expression must have been built on the
    /// coordinator thread; it is handed to a worker untouched.
    pub fn add_local_query(&mut self, expression: Box<dyn TableExpression>) {
        self.pending.push(ShardQuery::Local(expression));
    }

    /// Adds a shard dispatched over RPC, with its candidate replica hosts in preference
    /// order.
    pub fn add_remote_query(&mut self, qtree: QueryTreeNode, hosts: Vec<HostId>) {
        self.pending.push(ShardQuery::Remote { qtree, hosts });
    }

    pub fn num_shards(&self) -> usize {
        self.pending.len()
    }

    fn start(&mut self) {
        let shards = std::mem::take(&mut self.pending);
        let transport = self.transport.clone();
        let namespace = self.namespace.clone();
        let auth_token = self.auth.token().to_string();
        let query_id = self.query_id;

        tracing::debug!(
            %query_id,
            shards = shards.len(),
            max_concurrency = self.max_concurrency,
            "dispatching pipelined shards"
        );

        let stream = futures::stream::iter(shards.into_iter().enumerate())
            .map(move |(index, shard)| {
                let transport = transport.clone();
                let namespace = namespace.clone();
                let auth_token = auth_token.clone();
                async move {
                    match shard {
                        ShardQuery::Local(mut expression) => {
                            let mut rows = Vec::new();
                            while let Some(row) = expression.next().await? {
                                rows.push(row);
                            }
                            tracing::trace!(shard = index, rows = rows.len(), "local shard complete");
                            Ok(rows)
                        }
                        ShardQuery::Remote { qtree, hosts } => {
                            let request = RemoteShardRequest {
                                query_id,
                                namespace,
                                auth_token,
                                qtree,
                            };
                            dispatch_remote(transport, request, index, hosts).await
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrency.max(1))
            .boxed();

        self.running = Some(stream);
    }
}

#[async_trait]
impl TableExpression for PipelinedExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(row));
            }
            if self.ectx.is_cancelled() {
                self.running = None;
                self.done = true;
                return Err(ErrorKind::Cancelled.into());
            }
            if self.done {
                return Ok(None);
            }
            if self.running.is_none() {
                if self.pending.is_empty() {
                    self.done = true;
                    return Ok(None);
                }
                self.start();
            }

            let completed = match self.running.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            };

            match completed {
                Some(Ok(rows)) => self.buffered.extend(rows),
                Some(Err(error)) => {
                    // Dropping the stream aborts the in-flight shard futures; flagging
                    // the context lets local iterators stop early. Rows already buffered
                    // from completed peers are discarded, the statement has failed.
                    self.running = None;
                    self.done = true;
                    self.buffered.clear();
                    self.ectx.cancel();
                    return Err(error);
                }
                None => {
                    self.running = None;
                    self.done = true;
                }
            }
        }
    }
}

/// Runs a remote shard, failing over through its replica hosts.
async fn dispatch_remote(
    transport: Arc<dyn ShardTransport>,
    request: RemoteShardRequest,
    shard_index: usize,
    hosts: Vec<HostId>,
) -> crate::Result<Vec<Row>> {
    let mut last_error = None;

    for host in &hosts {
        match transport.execute(host, request.clone()).await {
            Ok(response) => {
                tracing::trace!(shard = shard_index, %host, "remote shard complete");
                return Ok(response.into_rows());
            }
            Err(error) if error.kind() == ErrorKind::ShardDispatchFailed => {
                tracing::warn!(
                    shard = shard_index,
                    %host,
                    %error,
                    "replica dispatch failed, trying next host"
                );
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }

    Err(match last_error {
        Some(error) => ErrorKind::ShardDispatchFailed.with_message(format!(
            "shard {shard_index}: all {} replicas failed: {error}",
            hosts.len()
        )),
        None => ErrorKind::ShardDispatchFailed
            .with_message(format!("shard {shard_index}: no replica hosts")),
    })
}
