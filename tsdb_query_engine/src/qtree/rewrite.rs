// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The time-suffix lift.
//!
//! Humans write `SELECT .. FROM requests.1700000000000000:1700086400000000`; the storage
//! layer accepts only bare table keys. For every sequential scan reachable from the
//! statement root whose table name carries a complete time range, the rewrite strips the
//! suffix and ANDs an explicit `time` predicate onto the scan's WHERE expression.
//!
//! The rewrite is idempotent: a rewritten scan has a bare table name, so a second pass
//! leaves it untouched. Scans carrying only one endpoint are left alone.

use super::{QueryTreeNode, TableRef, ValueExpressionNode};

pub fn rewrite_table_time_suffix(node: &mut QueryTreeNode) -> crate::Result<()> {
    if let QueryTreeNode::SequentialScan(scan) = node {
        let table_ref = TableRef::parse(scan.table_name())?;
        if let (Some(begin), Some(limit)) = (table_ref.timerange_begin, table_ref.timerange_limit) {
            scan.set_table_name(table_ref.table_key);

            let mut predicate = ValueExpressionNode::call(
                "logical_and",
                vec![
                    ValueExpressionNode::call(
                        "gte",
                        vec![
                            ValueExpressionNode::column("time"),
                            ValueExpressionNode::literal(begin),
                        ],
                    ),
                    ValueExpressionNode::call(
                        "lte",
                        vec![
                            ValueExpressionNode::column("time"),
                            ValueExpressionNode::literal(limit),
                        ],
                    ),
                ],
            );

            if let Some(where_expression) = scan.where_expression() {
                predicate =
                    ValueExpressionNode::call("logical_and", vec![where_expression.clone(), predicate]);
            }

            tracing::debug!(table = scan.table_name(), begin, limit, "lifted time-range suffix");
            scan.set_where_expression(predicate);
        }
    }

    for child in node.children_mut() {
        rewrite_table_time_suffix(child)?;
    }

    Ok(())
}
