// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The query scheduler.
//!
//! [`Scheduler::execute`] turns one statement of a [`QueryPlan`] into a [`ResultCursor`]:
//! it lifts time-range table suffixes into WHERE predicates, recursively builds the
//! executable expression tree, and wraps the root in a cursor. Plan construction runs
//! single-threaded on the coordinator; parallelism only enters through the pipelined
//! executor built for partition-parallel aggregations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::{PartitionMap, ReplicationScheme};
use crate::config::SchedulerConfig;
use crate::exec::group_by::GroupByCompilation;
use crate::exec::meta::DrawInputs;
use crate::exec::relational::{CompiledSelectList, SortExpr};
use crate::exec::{
    ChartExpression, DescribeTableExpression, GroupByExpression, GroupByMergeExpression,
    LimitExpression, NestedLoopJoin, OrderByExpression, PartialGroupByExpression,
    PipelinedExpression, ResultCursor, RunningGuard, SelectExpression, ShardTransport,
    ShowTablesExpression, SubqueryExpression, TableExpression,
};
use crate::expr::ValueExpression;
use crate::qtree::{
    rewrite_table_time_suffix, GroupByNode, QueryTreeNode, SelectListItem,
};
use crate::txn::{ClusterAuth, ExecutionContext, QueryPlan, Transaction};
use crate::ErrorKind;

mod split;

pub use split::PipelinedShard;

pub struct Scheduler {
    pmap: Arc<PartitionMap>,
    auth: Arc<ClusterAuth>,
    repl_scheme: Arc<dyn ReplicationScheme>,
    transport: Arc<dyn ShardTransport>,
    config: SchedulerConfig,
    running_cnt: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(
        pmap: Arc<PartitionMap>,
        auth: Arc<ClusterAuth>,
        repl_scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn ShardTransport>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pmap,
            auth,
            repl_scheme,
            transport,
            config,
            running_cnt: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The number of statements currently executing through this scheduler. Incremented
    /// on execution entry, decremented when the cursor is dropped.
    pub fn running_count(&self) -> usize {
        self.running_cnt.load(Ordering::SeqCst)
    }

    /// Builds the executable pipeline for one statement of the plan and returns a cursor
    /// over its results.
    #[tracing::instrument(level = "debug", skip_all, err, fields(stmt_idx = stmt_idx))]
    pub fn execute(&self, query_plan: &QueryPlan, stmt_idx: usize) -> crate::Result<ResultCursor> {
        let txn = query_plan.transaction();
        let mut qtree = query_plan.statement(stmt_idx)?.deep_copy();
        rewrite_table_time_suffix(&mut qtree)?;

        let ectx = Arc::new(ExecutionContext::new());
        let running = RunningGuard::new(self.running_cnt.clone());
        let root = self.build_expression(txn, &ectx, &qtree)?;
        Ok(ResultCursor::new(root, ectx, running))
    }

    /// Whether a subtree can be pushed to partition-resident workers without
    /// coordination: sequential scans and bare SELECTs are, subqueries inherit from
    /// their inner query, everything else is a coordination point.
    pub fn is_pipelineable(qtree: &QueryTreeNode) -> bool {
        match qtree {
            QueryTreeNode::SequentialScan(_) => true,
            QueryTreeNode::SelectExpression(_) => true,
            QueryTreeNode::Subquery(node) => Self::is_pipelineable(&node.subquery),
            _ => false,
        }
    }

    fn build_expression(
        &self,
        txn: &Arc<Transaction>,
        ectx: &Arc<ExecutionContext>,
        node: &QueryTreeNode,
    ) -> crate::Result<Box<dyn TableExpression>> {
        match node {
            QueryTreeNode::Limit(node) => Ok(Box::new(LimitExpression::new(
                node.limit,
                node.offset,
                self.build_expression(txn, ectx, &node.input)?,
            ))),

            QueryTreeNode::SelectExpression(node) => Ok(Box::new(SelectExpression::new(
                compile_select_list(txn, &node.select_list)?,
            ))),

            QueryTreeNode::Subquery(node) => {
                let where_expression = node
                    .where_expression
                    .as_ref()
                    .map(|e| txn.compiler().build_value_expression(txn, e))
                    .transpose()?;
                Ok(Box::new(SubqueryExpression::new(
                    compile_select_list(txn, &node.select_list)?,
                    where_expression,
                    self.build_expression(txn, ectx, &node.subquery)?,
                )))
            }

            QueryTreeNode::OrderBy(node) => {
                let sort_exprs = node
                    .sort_specs
                    .iter()
                    .map(|spec| {
                        Ok(SortExpr {
                            expr: txn.compiler().build_value_expression(txn, &spec.expression)?,
                            descending: spec.descending,
                        })
                    })
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(Box::new(OrderByExpression::new(
                    sort_exprs,
                    self.build_expression(txn, ectx, &node.input)?,
                )))
            }

            QueryTreeNode::SequentialScan(node) => {
                match txn.table_provider().build_sequential_scan(txn, ectx, node)? {
                    Some(expression) => Ok(expression),
                    None => Err(ErrorKind::TableNotFound
                        .with_message(format!("table not found: {}", node.table_name()))),
                }
            }

            QueryTreeNode::GroupBy(node) => {
                if node.is_partial_aggregation() {
                    return self.build_partial_group_by(txn, ectx, node);
                }
                if Self::is_pipelineable(&node.input) {
                    self.build_pipeline_group_by(txn, ectx, node)
                } else {
                    let compilation =
                        GroupByCompilation::compile(txn, &node.select_list, &node.group_expressions)?;
                    Ok(Box::new(GroupByExpression::new(
                        compilation,
                        self.build_expression(txn, ectx, &node.input)?,
                    )))
                }
            }

            QueryTreeNode::ShowTables => Ok(Box::new(ShowTablesExpression::new(
                txn.table_provider().list_tables(),
            ))),

            QueryTreeNode::DescribeTable(node) => {
                match txn.table_provider().describe_table(&node.table_name) {
                    Some(schema) => Ok(Box::new(DescribeTableExpression::new(&schema))),
                    None => Err(ErrorKind::TableNotFound
                        .with_message(format!("table not found: {}", node.table_name))),
                }
            }

            QueryTreeNode::Join(node) => {
                let where_expression = node
                    .where_expression
                    .as_ref()
                    .map(|e| txn.compiler().build_value_expression(txn, e))
                    .transpose()?;
                let join_condition = node
                    .join_condition
                    .as_ref()
                    .map(|e| txn.compiler().build_value_expression(txn, e))
                    .transpose()?;
                Ok(Box::new(NestedLoopJoin::new(
                    node.join_type,
                    compile_select_list(txn, &node.select_list)?,
                    join_condition,
                    where_expression,
                    self.build_expression(txn, ectx, &node.base_table)?,
                    self.build_expression(txn, ectx, &node.joined_table)?,
                )))
            }

            QueryTreeNode::ChartStatement(node) => {
                let mut draws = Vec::with_capacity(node.draw_statements.len());
                for draw in &node.draw_statements {
                    let inputs = draw
                        .input_tables
                        .iter()
                        .map(|input| self.build_expression(txn, ectx, input))
                        .collect::<crate::Result<Vec<_>>>()?;
                    draws.push(DrawInputs {
                        chart_type: draw.chart_type,
                        inputs,
                    });
                }
                Ok(Box::new(ChartExpression::new(draws)))
            }

            QueryTreeNode::Extension(_) => Err(ErrorKind::RuntimeError.with_message(format!(
                "cannot figure out how to execute that query, sorry. -- {node}"
            ))),
        }
    }

    fn build_partial_group_by(
        &self,
        txn: &Arc<Transaction>,
        ectx: &Arc<ExecutionContext>,
        node: &GroupByNode,
    ) -> crate::Result<Box<dyn TableExpression>> {
        let compilation =
            GroupByCompilation::compile(txn, &node.select_list, &node.group_expressions)?;
        Ok(Box::new(PartialGroupByExpression::new(
            compilation,
            self.build_expression(txn, ectx, &node.input)?,
        )))
    }

    /// Splits a GROUP BY over a pipelineable input into per-partition partial
    /// aggregations under a merge operator.
    fn build_pipeline_group_by(
        &self,
        txn: &Arc<Transaction>,
        ectx: &Arc<ExecutionContext>,
        node: &GroupByNode,
    ) -> crate::Result<Box<dyn TableExpression>> {
        let shards = self.pipeline_expression(txn, &node.input)?;

        let mut pipelined = PipelinedExpression::new(
            txn.namespace(),
            self.auth.clone(),
            self.transport.clone(),
            self.config.max_concurrency,
            ectx.clone(),
        );

        for shard in shards {
            let mut group_copy = GroupByNode::new(
                node.select_list.clone(),
                node.group_expressions.clone(),
                shard.qtree,
            );
            group_copy.set_is_partial_aggregation(true);

            if shard.is_local {
                let partial = self.build_partial_group_by(txn, ectx, &group_copy)?;
                pipelined.add_local_query(partial);
            } else {
                pipelined.add_remote_query(QueryTreeNode::GroupBy(group_copy), shard.hosts);
            }
        }

        let compilation =
            GroupByCompilation::compile(txn, &node.select_list, &node.group_expressions)?;
        Ok(Box::new(GroupByMergeExpression::new(
            compilation,
            Box::new(pipelined),
        )))
    }
}

fn compile_select_list(
    txn: &Transaction,
    select_list: &[SelectListItem],
) -> crate::Result<CompiledSelectList> {
    select_list
        .iter()
        .map(|item| {
            let expression: ValueExpression =
                txn.compiler().build_value_expression(txn, &item.expression)?;
            Ok((item.column_name(), expression))
        })
        .collect()
}
