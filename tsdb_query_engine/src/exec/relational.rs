// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::expr::ValueExpression;
use crate::qtree::JoinType;
use crate::value;

use super::{Row, RowSchema, TableExpression};

/// A compiled select list: output column names and the expressions that produce them.
pub type CompiledSelectList = Vec<(String, ValueExpression)>;

fn output_schema(select: &CompiledSelectList) -> Arc<RowSchema> {
    Arc::new(RowSchema::new(
        select.iter().map(|(name, _)| name.clone()).collect(),
    ))
}

fn project(select: &CompiledSelectList, schema: &Arc<RowSchema>, input: &Row) -> crate::Result<Row> {
    let values = select
        .iter()
        .map(|(_, expression)| expression.evaluate(input))
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(Row::new(schema.clone(), values))
}

/// Applies LIMIT and OFFSET to its input stream.
pub struct LimitExpression {
    limit: u64,
    offset: u64,
    skipped: u64,
    returned: u64,
    input: Box<dyn TableExpression>,
}

impl LimitExpression {
    pub fn new(limit: u64, offset: u64, input: Box<dyn TableExpression>) -> Self {
        Self {
            limit,
            offset,
            skipped: 0,
            returned: 0,
            input,
        }
    }
}

#[async_trait]
impl TableExpression for LimitExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        while self.skipped < self.offset {
            if self.input.next().await?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }

        if self.returned >= self.limit {
            return Ok(None);
        }

        match self.input.next().await? {
            Some(row) => {
                self.returned += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

/// A SELECT without a FROM clause: evaluates its select list once.
pub struct SelectExpression {
    select: CompiledSelectList,
    schema: Arc<RowSchema>,
    done: bool,
}

impl SelectExpression {
    pub fn new(select: CompiledSelectList) -> Self {
        let schema = output_schema(&select);
        Self {
            select,
            schema,
            done: false,
        }
    }
}

#[async_trait]
impl TableExpression for SelectExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(project(&self.select, &self.schema, &Row::empty())?))
    }
}

/// Projects and filters the rows of an inner query.
pub struct SubqueryExpression {
    select: CompiledSelectList,
    where_expression: Option<ValueExpression>,
    schema: Arc<RowSchema>,
    input: Box<dyn TableExpression>,
}

impl SubqueryExpression {
    pub fn new(
        select: CompiledSelectList,
        where_expression: Option<ValueExpression>,
        input: Box<dyn TableExpression>,
    ) -> Self {
        let schema = output_schema(&select);
        Self {
            select,
            where_expression,
            schema,
            input,
        }
    }
}

#[async_trait]
impl TableExpression for SubqueryExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        loop {
            let Some(row) = self.input.next().await? else {
                return Ok(None);
            };

            if let Some(filter) = &self.where_expression {
                if !value::is_truthy(&filter.evaluate(&row)?) {
                    continue;
                }
            }

            return Ok(Some(project(&self.select, &self.schema, &row)?));
        }
    }
}

pub struct SortExpr {
    pub expr: ValueExpression,
    pub descending: bool,
}

/// Buffers and sorts its entire input before emitting the first row.
pub struct OrderByExpression {
    sort_exprs: Vec<SortExpr>,
    input: Box<dyn TableExpression>,
    sorted: Option<std::vec::IntoIter<Row>>,
}

impl OrderByExpression {
    pub fn new(sort_exprs: Vec<SortExpr>, input: Box<dyn TableExpression>) -> Self {
        Self {
            sort_exprs,
            input,
            sorted: None,
        }
    }

    async fn sort_input(&mut self) -> crate::Result<Vec<Row>> {
        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::new();
        while let Some(row) = self.input.next().await? {
            let key = self
                .sort_exprs
                .iter()
                .map(|sort| sort.expr.evaluate(&row))
                .collect::<crate::Result<Vec<_>>>()?;
            keyed.push((key, row));
        }

        keyed.sort_by(|(left, _), (right, _)| {
            for (i, sort) in self.sort_exprs.iter().enumerate() {
                // Sort keys were evaluated from the same expressions, so comparison
                // only fails on non-primitive values.
                let ordering = value::compare(&left[i], &right[i])
                    .expect("sort keys should be comparable");
                let ordering = if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

#[async_trait]
impl TableExpression for OrderByExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.sorted.is_none() {
            let rows = self.sort_input().await?;
            self.sorted = Some(rows.into_iter());
        }
        Ok(self.sorted.as_mut().and_then(|rows| rows.next()))
    }
}

/// Joins two inputs by scanning the full joined side for every base row.
///
/// There is no hash-join path; join inputs in this engine are small dimension tables.
pub struct NestedLoopJoin {
    join_type: JoinType,
    select: CompiledSelectList,
    join_condition: Option<ValueExpression>,
    where_expression: Option<ValueExpression>,
    schema: Arc<RowSchema>,
    base: Box<dyn TableExpression>,
    joined: Box<dyn TableExpression>,
    joined_rows: Option<Vec<Row>>,
    combined_schema: Option<Arc<RowSchema>>,
    current: Option<BaseCursor>,
}

struct BaseCursor {
    row: Row,
    joined_idx: usize,
    matched: bool,
}

impl NestedLoopJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        join_type: JoinType,
        select: CompiledSelectList,
        join_condition: Option<ValueExpression>,
        where_expression: Option<ValueExpression>,
        base: Box<dyn TableExpression>,
        joined: Box<dyn TableExpression>,
    ) -> Self {
        let schema = output_schema(&select);
        Self {
            join_type,
            select,
            join_condition,
            where_expression,
            schema,
            base,
            joined,
            joined_rows: None,
            combined_schema: None,
            current: None,
        }
    }

    fn combine(&mut self, base: &Row, joined: Option<&Row>) -> Row {
        let joined_width = joined.map(|row| row.schema().len()).unwrap_or_else(|| {
            self.combined_schema
                .as_ref()
                .map(|schema| schema.len() - base.schema().len())
                .unwrap_or(0)
        });

        let schema = match &self.combined_schema {
            Some(schema) => schema.clone(),
            None => {
                let mut columns = base.schema().columns().to_vec();
                if let Some(joined) = joined {
                    columns.extend(joined.schema().columns().iter().cloned());
                }
                let schema = Arc::new(RowSchema::new(columns));
                self.combined_schema = Some(schema.clone());
                schema
            }
        };

        let mut values = base.values().to_vec();
        match joined {
            Some(joined) => values.extend(joined.values().iter().cloned()),
            None => values.extend(std::iter::repeat(Value::Null).take(joined_width)),
        }
        Row::new(schema, values)
    }

    fn passes(
        expression: &Option<ValueExpression>,
        row: &Row,
    ) -> crate::Result<bool> {
        match expression {
            Some(expression) => Ok(value::is_truthy(&expression.evaluate(row)?)),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl TableExpression for NestedLoopJoin {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.joined_rows.is_none() {
            let mut rows = Vec::new();
            while let Some(row) = self.joined.next().await? {
                rows.push(row);
            }
            self.joined_rows = Some(rows);
        }

        loop {
            let mut cursor = match self.current.take() {
                Some(cursor) => cursor,
                None => match self.base.next().await? {
                    Some(row) => BaseCursor {
                        row,
                        joined_idx: 0,
                        matched: false,
                    },
                    None => return Ok(None),
                },
            };

            let joined_rows = self.joined_rows.take().unwrap_or_default();
            let mut result = None;

            while cursor.joined_idx < joined_rows.len() {
                let joined_row = &joined_rows[cursor.joined_idx];
                cursor.joined_idx += 1;
                let combined = self.combine(&cursor.row, Some(joined_row));

                if !Self::passes(&self.join_condition, &combined)? {
                    continue;
                }
                cursor.matched = true;

                if Self::passes(&self.where_expression, &combined)? {
                    result = Some(project(&self.select, &self.schema, &combined)?);
                }
                break;
            }

            let exhausted = cursor.joined_idx >= joined_rows.len();
            self.joined_rows = Some(joined_rows);

            if let Some(row) = result {
                self.current = Some(cursor);
                return Ok(Some(row));
            }

            if !exhausted {
                // The condition matched but WHERE rejected the pair; keep probing the
                // remaining joined rows for this base row.
                self.current = Some(cursor);
                continue;
            }

            // LEFT JOIN emits unmatched base rows once, extended with NULLs.
            if self.join_type == JoinType::Left && !cursor.matched {
                let combined = self.combine(&cursor.row, None);
                if Self::passes(&self.where_expression, &combined)? {
                    return Ok(Some(project(&self.select, &self.schema, &combined)?));
                }
            }
        }
    }
}
