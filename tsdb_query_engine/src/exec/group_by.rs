// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GROUP BY execution, in three shapes.
//!
//! * [`GroupByExpression`]: the unsharded case. Group, accumulate, finalize in-process.
//! * [`PartialGroupByExpression`]: the per-shard phase of a split aggregation. Emits
//!   one row per group laid out as `[group values..., accumulator states...]`, reducing
//!   a shard's output to group cardinality before it crosses the network.
//! * [`GroupByMergeExpression`]: the coordinator phase. Re-keys partial rows by their
//!   group values, combines accumulator states, and finalizes the original select list.
//!
//! A select list under GROUP BY is compiled once into a [`GroupByCompilation`]: every
//! select item must resolve to a group expression, an aggregate call, or a scalar
//! composition of those; anything else is rejected at compile time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::expr::{ScalarFunction, ValueExpression};
use crate::qtree::{SelectListItem, ValueExpressionNode};
use crate::txn::Transaction;
use crate::ErrorKind;

use super::aggregate::{Accumulator, AggregateFunction};
use super::{Row, RowSchema, TableExpression};

#[derive(Debug)]
pub struct CompiledAggregate {
    function: AggregateFunction,
    args: Vec<ValueExpression>,
    name: String,
}

/// A select item compiled against a grouping scope: group keys and aggregate results
/// replace column references.
#[derive(Debug)]
enum OutputInstr {
    GroupKey(usize),
    Aggregate(usize),
    Literal(Value),
    Call {
        function: ScalarFunction,
        args: Vec<OutputInstr>,
    },
}

impl OutputInstr {
    fn evaluate(&self, group_values: &[Value], aggregate_values: &[Value]) -> crate::Result<Value> {
        match self {
            OutputInstr::GroupKey(index) => Ok(group_values[*index].clone()),
            OutputInstr::Aggregate(index) => Ok(aggregate_values[*index].clone()),
            OutputInstr::Literal(value) => Ok(value.clone()),
            OutputInstr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(group_values, aggregate_values))
                    .collect::<crate::Result<Vec<_>>>()?;
                function.evaluate(&args)
            }
        }
    }
}

/// The compiled form of a GROUP BY's select list and group expressions. Shared by all
/// three execution shapes so the partial and merge phases agree on row layout.
#[derive(Debug)]
pub struct GroupByCompilation {
    group_names: Vec<String>,
    group_expressions: Vec<ValueExpression>,
    aggregates: Vec<CompiledAggregate>,
    outputs: Vec<(String, OutputInstr)>,
}

impl GroupByCompilation {
    pub fn compile(
        txn: &Transaction,
        select_list: &[SelectListItem],
        group_expressions: &[ValueExpressionNode],
    ) -> crate::Result<Self> {
        let compiled_groups = group_expressions
            .iter()
            .map(|node| txn.compiler().build_value_expression(txn, node))
            .collect::<crate::Result<Vec<_>>>()?;

        let mut compilation = Self {
            group_names: group_expressions.iter().map(|g| g.to_string()).collect(),
            group_expressions: compiled_groups,
            aggregates: Vec::new(),
            outputs: Vec::new(),
        };

        for item in select_list {
            let instr = compilation.classify(txn, &item.expression, group_expressions)?;
            compilation.outputs.push((item.column_name(), instr));
        }

        Ok(compilation)
    }

    fn classify(
        &mut self,
        txn: &Transaction,
        node: &ValueExpressionNode,
        group_expressions: &[ValueExpressionNode],
    ) -> crate::Result<OutputInstr> {
        if let Some(index) = group_expressions.iter().position(|g| g == node) {
            return Ok(OutputInstr::GroupKey(index));
        }

        match node {
            ValueExpressionNode::Call { function, args } => {
                if let Some(aggregate) = AggregateFunction::from_name(function) {
                    return self.register_aggregate(txn, node, aggregate, args);
                }

                let scalar = ScalarFunction::from_name(function).ok_or_else(|| {
                    ErrorKind::CompilationError
                        .with_message(format!("unknown function: {function}"))
                })?;
                if args.len() != scalar.arity() {
                    return Err(ErrorKind::CompilationError.with_message(format!(
                        "{function} expects {} arguments, got {}",
                        scalar.arity(),
                        args.len()
                    )));
                }
                let args = args
                    .iter()
                    .map(|arg| self.classify(txn, arg, group_expressions))
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(OutputInstr::Call {
                    function: scalar,
                    args,
                })
            }
            ValueExpressionNode::Literal(value) => Ok(OutputInstr::Literal(value.clone())),
            ValueExpressionNode::ColumnReference(name) => {
                Err(ErrorKind::CompilationError.with_message(format!(
                    "column {name} must appear in the GROUP BY clause or an aggregate function"
                )))
            }
        }
    }

    fn register_aggregate(
        &mut self,
        txn: &Transaction,
        node: &ValueExpressionNode,
        function: AggregateFunction,
        args: &[ValueExpressionNode],
    ) -> crate::Result<OutputInstr> {
        // COUNT counts rows when called without arguments; everything else takes
        // exactly one.
        let valid_arity = match function {
            AggregateFunction::Count => args.len() <= 1,
            _ => args.len() == 1,
        };
        if !valid_arity {
            return Err(ErrorKind::CompilationError
                .with_message(format!("invalid argument count for {node}")));
        }

        let args = args
            .iter()
            .map(|arg| txn.compiler().build_value_expression(txn, arg))
            .collect::<crate::Result<Vec<_>>>()?;

        self.aggregates.push(CompiledAggregate {
            function,
            args,
            name: node.to_string(),
        });
        Ok(OutputInstr::Aggregate(self.aggregates.len() - 1))
    }

    fn new_accumulators(&self) -> Vec<Accumulator> {
        self.aggregates
            .iter()
            .map(|aggregate| aggregate.function.accumulator())
            .collect()
    }

    fn output_schema(&self) -> Arc<RowSchema> {
        Arc::new(RowSchema::new(
            self.outputs.iter().map(|(name, _)| name.clone()).collect(),
        ))
    }

    /// The schema of partial rows: group values first, accumulator states after.
    fn partial_schema(&self) -> Arc<RowSchema> {
        let mut columns = self.group_names.clone();
        columns.extend(self.aggregates.iter().map(|a| a.name.clone()));
        Arc::new(RowSchema::new(columns))
    }

    fn finalize_group(
        &self,
        schema: &Arc<RowSchema>,
        group_values: Vec<Value>,
        accumulators: Vec<Accumulator>,
    ) -> crate::Result<Row> {
        let aggregate_values = accumulators
            .into_iter()
            .map(Accumulator::finalize)
            .collect::<crate::Result<Vec<_>>>()?;

        let values = self
            .outputs
            .iter()
            .map(|(_, instr)| instr.evaluate(&group_values, &aggregate_values))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Row::new(schema.clone(), values))
    }
}

/// Accumulated groups in first-seen order.
struct Groups {
    by_key: HashMap<String, usize>,
    entries: Vec<(Vec<Value>, Vec<Accumulator>)>,
}

impl Groups {
    fn new(compilation: &GroupByCompilation) -> Self {
        let mut groups = Self {
            by_key: HashMap::new(),
            entries: Vec::new(),
        };
        // A GROUP BY without group expressions aggregates the whole input into a single
        // group, which must exist even when the input is empty.
        if compilation.group_expressions.is_empty() {
            groups.entries.push((Vec::new(), compilation.new_accumulators()));
            groups.by_key.insert("[]".to_string(), 0);
        }
        groups
    }

    fn entry(
        &mut self,
        compilation: &GroupByCompilation,
        group_values: Vec<Value>,
    ) -> crate::Result<&mut Vec<Accumulator>> {
        let key = serde_json::to_string(&group_values)
            .map_err(|e| ErrorKind::SerializationError.with_source(e))?;
        let index = match self.by_key.get(&key) {
            Some(index) => *index,
            None => {
                self.entries.push((group_values, compilation.new_accumulators()));
                self.by_key.insert(key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        Ok(&mut self.entries[index].1)
    }
}

/// Groups its input rows and updates the accumulators row by row.
async fn accumulate_input(
    compilation: &GroupByCompilation,
    input: &mut dyn TableExpression,
) -> crate::Result<Groups> {
    let mut groups = Groups::new(compilation);

    while let Some(row) = input.next().await? {
        let group_values = compilation
            .group_expressions
            .iter()
            .map(|expression| expression.evaluate(&row))
            .collect::<crate::Result<Vec<_>>>()?;

        let accumulators = groups.entry(compilation, group_values)?;
        for (accumulator, aggregate) in accumulators.iter_mut().zip(&compilation.aggregates) {
            let args = aggregate
                .args
                .iter()
                .map(|arg| arg.evaluate(&row))
                .collect::<crate::Result<Vec<_>>>()?;
            accumulator.update(&args)?;
        }
    }

    Ok(groups)
}

/// The unsharded GROUP BY: everything happens in-process.
pub struct GroupByExpression {
    compilation: GroupByCompilation,
    input: Box<dyn TableExpression>,
    finalized: Option<std::vec::IntoIter<Row>>,
}

impl GroupByExpression {
    pub fn new(compilation: GroupByCompilation, input: Box<dyn TableExpression>) -> Self {
        Self {
            compilation,
            input,
            finalized: None,
        }
    }
}

#[async_trait]
impl TableExpression for GroupByExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.finalized.is_none() {
            let groups = accumulate_input(&self.compilation, self.input.as_mut()).await?;
            let schema = self.compilation.output_schema();
            let rows = groups
                .entries
                .into_iter()
                .map(|(group_values, accumulators)| {
                    self.compilation.finalize_group(&schema, group_values, accumulators)
                })
                .collect::<crate::Result<Vec<_>>>()?;
            self.finalized = Some(rows.into_iter());
        }
        Ok(self.finalized.as_mut().and_then(|rows| rows.next()))
    }
}

/// The per-shard phase of a split aggregation: emits accumulator state instead of
/// finalized values.
pub struct PartialGroupByExpression {
    compilation: GroupByCompilation,
    input: Box<dyn TableExpression>,
    partials: Option<std::vec::IntoIter<Row>>,
}

impl PartialGroupByExpression {
    pub fn new(compilation: GroupByCompilation, input: Box<dyn TableExpression>) -> Self {
        Self {
            compilation,
            input,
            partials: None,
        }
    }
}

#[async_trait]
impl TableExpression for PartialGroupByExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.partials.is_none() {
            let groups = accumulate_input(&self.compilation, self.input.as_mut()).await?;
            let schema = self.compilation.partial_schema();
            let rows = groups
                .entries
                .into_iter()
                .map(|(mut group_values, accumulators)| {
                    for accumulator in &accumulators {
                        group_values.push(accumulator.state()?);
                    }
                    Ok(Row::new(schema.clone(), group_values))
                })
                .collect::<crate::Result<Vec<_>>>()?;
            self.partials = Some(rows.into_iter());
        }
        Ok(self.partials.as_mut().and_then(|rows| rows.next()))
    }
}

/// The coordinator phase of a split aggregation: merges the partial rows produced by
/// every shard and finalizes the original select list.
pub struct GroupByMergeExpression {
    compilation: GroupByCompilation,
    input: Box<dyn TableExpression>,
    merged: Option<std::vec::IntoIter<Row>>,
}

impl GroupByMergeExpression {
    pub fn new(compilation: GroupByCompilation, input: Box<dyn TableExpression>) -> Self {
        Self {
            compilation,
            input,
            merged: None,
        }
    }

    async fn merge_input(&mut self) -> crate::Result<Vec<Row>> {
        let group_count = self.compilation.group_expressions.len();
        let aggregate_count = self.compilation.aggregates.len();
        let mut groups = Groups::new(&self.compilation);

        while let Some(row) = self.input.next().await? {
            let mut values = row.into_values();
            if values.len() != group_count + aggregate_count {
                return Err(ErrorKind::RuntimeError.with_message(format!(
                    "partial aggregation row has {} columns, expected {}",
                    values.len(),
                    group_count + aggregate_count
                )));
            }
            let states = values.split_off(group_count);

            let accumulators = groups.entry(&self.compilation, values)?;
            for (accumulator, state) in accumulators.iter_mut().zip(&states) {
                accumulator.merge(state)?;
            }
        }

        let schema = self.compilation.output_schema();
        groups
            .entries
            .into_iter()
            .map(|(group_values, accumulators)| {
                self.compilation.finalize_group(&schema, group_values, accumulators)
            })
            .collect()
    }
}

#[async_trait]
impl TableExpression for GroupByMergeExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.merged.is_none() {
            let rows = self.merge_input().await?;
            self.merged = Some(rows.into_iter());
        }
        Ok(self.merged.as_mut().and_then(|rows| rows.next()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::exec::VecRowsExpression;
    use crate::txn::test_transaction;

    use super::*;

    fn input_rows() -> Vec<Row> {
        let schema = Arc::new(RowSchema::new(vec!["dept".to_string(), "x".to_string()]));
        [
            ("a", 10),
            ("b", 1),
            ("a", 20),
            ("b", 2),
            ("a", 30),
        ]
        .into_iter()
        .map(|(dept, x)| Row::new(schema.clone(), vec![json!(dept), json!(x)]))
        .collect()
    }

    fn select_list() -> Vec<SelectListItem> {
        vec![
            SelectListItem::new(ValueExpressionNode::column("dept")),
            SelectListItem::with_alias(ValueExpressionNode::call("count", vec![]), "rows"),
            SelectListItem::with_alias(
                ValueExpressionNode::call("sum", vec![ValueExpressionNode::column("x")]),
                "total",
            ),
        ]
    }

    fn compile() -> GroupByCompilation {
        let txn = test_transaction();
        GroupByCompilation::compile(
            &txn,
            &select_list(),
            &[ValueExpressionNode::column("dept")],
        )
        .unwrap()
    }

    fn drain(expression: &mut dyn TableExpression) -> Vec<Vec<Value>> {
        futures::executor::block_on(async {
            let mut rows = Vec::new();
            while let Some(row) = expression.next().await.unwrap() {
                rows.push(row.into_values());
            }
            rows.sort_by_key(|values| values[0].to_string());
            rows
        })
    }

    #[test]
    fn groups_and_finalizes() {
        let mut expression = GroupByExpression::new(
            compile(),
            Box::new(VecRowsExpression::new(input_rows())),
        );

        assert_eq!(
            drain(&mut expression),
            vec![
                vec![json!("a"), json!(3), json!(60.0)],
                vec![json!("b"), json!(2), json!(3.0)],
            ]
        );
    }

    #[test]
    fn split_aggregation_matches_single_node_results() {
        // Shard the input in two, run a partial per shard, and merge; the merge output
        // must match the unsharded GROUP BY.
        let rows = input_rows();
        let (left, right) = rows.split_at(2);

        let mut partial_rows = Vec::new();
        for shard in [left.to_vec(), right.to_vec()] {
            let mut partial = PartialGroupByExpression::new(
                compile(),
                Box::new(VecRowsExpression::new(shard)),
            );
            futures::executor::block_on(async {
                while let Some(row) = partial.next().await.unwrap() {
                    partial_rows.push(row);
                }
            });
        }

        let mut merge = GroupByMergeExpression::new(
            compile(),
            Box::new(VecRowsExpression::new(partial_rows)),
        );
        let mut single = GroupByExpression::new(
            compile(),
            Box::new(VecRowsExpression::new(input_rows())),
        );

        assert_eq!(drain(&mut merge), drain(&mut single));
    }

    #[test]
    fn global_aggregate_emits_a_row_for_empty_input() {
        let txn = test_transaction();
        let compilation = GroupByCompilation::compile(
            &txn,
            &[SelectListItem::with_alias(
                ValueExpressionNode::call("count", vec![]),
                "rows",
            )],
            &[],
        )
        .unwrap();

        let mut expression =
            GroupByExpression::new(compilation, Box::new(VecRowsExpression::new(Vec::new())));
        assert_eq!(drain(&mut expression), vec![vec![json!(0)]]);
    }

    #[test]
    fn scalar_compositions_over_aggregates_are_allowed() {
        let txn = test_transaction();
        let compilation = GroupByCompilation::compile(
            &txn,
            &[SelectListItem::with_alias(
                ValueExpressionNode::call(
                    "mul",
                    vec![
                        ValueExpressionNode::call("count", vec![]),
                        ValueExpressionNode::literal(2),
                    ],
                ),
                "doubled",
            )],
            &[],
        )
        .unwrap();

        let mut expression = GroupByExpression::new(
            compilation,
            Box::new(VecRowsExpression::new(input_rows())),
        );
        assert_eq!(drain(&mut expression), vec![vec![json!(10)]]);
    }

    #[test]
    fn stray_columns_are_rejected() {
        let txn = test_transaction();
        let err = GroupByCompilation::compile(
            &txn,
            &[SelectListItem::new(ValueExpressionNode::column("x"))],
            &[ValueExpressionNode::column("dept")],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompilationError);
    }

    #[test]
    fn merge_rejects_malformed_partial_rows() {
        let schema = Arc::new(RowSchema::new(vec!["only".to_string()]));
        let mut merge = GroupByMergeExpression::new(
            compile(),
            Box::new(VecRowsExpression::new(vec![Row::new(
                schema,
                vec![json!("a")],
            )])),
        );
        let error = futures::executor::block_on(merge.next()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RuntimeError);
    }
}
