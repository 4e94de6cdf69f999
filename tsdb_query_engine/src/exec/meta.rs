// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cluster::TableSchema;
use crate::qtree::ChartType;
use crate::txn::TableListEntry;

use super::{Row, RowSchema, TableExpression, VecRowsExpression};

/// Emits one row per table known to the transaction's table provider.
pub struct ShowTablesExpression {
    rows: VecRowsExpression,
}

impl ShowTablesExpression {
    pub fn new(mut tables: Vec<TableListEntry>) -> Self {
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        let schema = Arc::new(RowSchema::new(vec![
            "table_name".to_string(),
            "description".to_string(),
        ]));
        let rows = tables
            .into_iter()
            .map(|table| {
                Row::new(
                    schema.clone(),
                    vec![json!(table.name), json!(table.description)],
                )
            })
            .collect();
        Self {
            rows: VecRowsExpression::new(rows),
        }
    }
}

#[async_trait]
impl TableExpression for ShowTablesExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        self.rows.next().await
    }
}

/// Emits one row per column of the described table.
pub struct DescribeTableExpression {
    rows: VecRowsExpression,
}

impl DescribeTableExpression {
    pub fn new(schema: &TableSchema) -> Self {
        let row_schema = Arc::new(RowSchema::new(vec![
            "column_name".to_string(),
            "type".to_string(),
            "nullable".to_string(),
        ]));
        let rows = schema
            .columns
            .iter()
            .map(|column| {
                Row::new(
                    row_schema.clone(),
                    vec![
                        json!(column.name),
                        json!(column.type_name),
                        json!(column.nullable),
                    ],
                )
            })
            .collect();
        Self {
            rows: VecRowsExpression::new(rows),
        }
    }
}

#[async_trait]
impl TableExpression for DescribeTableExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        self.rows.next().await
    }
}

/// One draw statement's inputs, built by the scheduler.
pub struct DrawInputs {
    pub chart_type: ChartType,
    pub inputs: Vec<Box<dyn TableExpression>>,
}

/// Renders chart statements.
///
/// Each draw statement's input tables are drained into series; the expression emits one
/// row per draw statement carrying the chart specification as a JSON document. Actual
/// raster/vector rendering happens in the client.
pub struct ChartExpression {
    draws: Vec<DrawInputs>,
    rendered: Option<std::vec::IntoIter<Row>>,
}

impl ChartExpression {
    pub fn new(draws: Vec<DrawInputs>) -> Self {
        Self {
            draws,
            rendered: None,
        }
    }

    async fn render(&mut self) -> crate::Result<Vec<Row>> {
        let schema = Arc::new(RowSchema::new(vec!["chart".to_string()]));
        let mut rows = Vec::with_capacity(self.draws.len());

        for draw in &mut self.draws {
            let mut series = Vec::with_capacity(draw.inputs.len());
            for input in &mut draw.inputs {
                let mut data = Vec::new();
                while let Some(row) = input.next().await? {
                    data.push(json!({
                        "columns": row.schema().columns(),
                        "values": row.values(),
                    }));
                }
                series.push(json!({ "rows": data }));
            }

            let chart_type = match draw.chart_type {
                ChartType::Area => "area",
                ChartType::Bar => "bar",
                ChartType::Line => "line",
                ChartType::Points => "points",
            };
            rows.push(Row::new(
                schema.clone(),
                vec![json!({ "type": chart_type, "series": series })],
            ));
        }

        Ok(rows)
    }
}

#[async_trait]
impl TableExpression for ChartExpression {
    async fn next(&mut self) -> crate::Result<Option<Row>> {
        if self.rendered.is_none() {
            let rows = self.render().await?;
            self.rendered = Some(rows.into_iter());
        }
        Ok(self.rendered.as_mut().and_then(|rows| rows.next()))
    }
}
