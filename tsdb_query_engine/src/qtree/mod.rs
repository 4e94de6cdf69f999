// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The logical query tree consumed by the scheduler.
//!
//! The planner (an external collaborator) hands the scheduler a tree of relational
//! operators. The tree is a closed sum type: the expression builder matches it
//! exhaustively, so an unbuildable node can only be the [`Extension`](QueryTreeNode::Extension)
//! variant retained for forward compatibility.
//!
//! Nodes are owned values and immutable once planned, with two exceptions required by the
//! scheduler: a sequential scan's table name and WHERE expression can be replaced (the
//! time-suffix rewrite and the partition-addressed shard rewrite), and a GROUP BY can be
//! flagged as a partial aggregation. Deep copy is a structural clone, which keeps
//! per-partition shards mutually independent.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod rewrite;
pub mod table_ref;

pub use rewrite::rewrite_table_time_suffix;
pub use table_ref::TableRef;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryTreeNode {
    Limit(LimitNode),
    SelectExpression(SelectExpressionNode),
    Subquery(SubqueryNode),
    OrderBy(OrderByNode),
    SequentialScan(SequentialScanNode),
    GroupBy(GroupByNode),
    ShowTables,
    DescribeTable(DescribeTableNode),
    Join(JoinNode),
    ChartStatement(ChartStatementNode),

    /// An opaque node produced by a newer planner than this scheduler. The expression
    /// builder rejects it at execution time rather than failing to deserialize the plan.
    Extension(ExtensionNode),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimitNode {
    pub limit: u64,
    pub offset: u64,
    pub input: Box<QueryTreeNode>,
}

/// One item of a SELECT list: an expression and an optional alias.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectListItem {
    pub expression: ValueExpressionNode,
    pub alias: Option<String>,
}

impl SelectListItem {
    pub fn new(expression: ValueExpressionNode) -> Self {
        Self {
            expression,
            alias: None,
        }
    }

    pub fn with_alias(expression: ValueExpressionNode, alias: impl Into<String>) -> Self {
        Self {
            expression,
            alias: Some(alias.into()),
        }
    }

    /// The output column name for this item: the alias if present, otherwise the
    /// expression's display form.
    pub fn column_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.expression.to_string(),
        }
    }
}

/// A SELECT without a FROM clause; evaluates its select list exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectExpressionNode {
    pub select_list: Vec<SelectListItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubqueryNode {
    pub select_list: Vec<SelectListItem>,
    pub where_expression: Option<ValueExpressionNode>,
    pub subquery: Box<QueryTreeNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub expression: ValueExpressionNode,
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderByNode {
    pub sort_specs: Vec<SortSpec>,
    pub input: Box<QueryTreeNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequentialScanNode {
    table_name: String,
    pub select_list: Vec<SelectListItem>,
    where_expression: Option<ValueExpressionNode>,
}

impl SequentialScanNode {
    pub fn new(
        table_name: impl Into<String>,
        select_list: Vec<SelectListItem>,
        where_expression: Option<ValueExpressionNode>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            select_list,
            where_expression,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn where_expression(&self) -> Option<&ValueExpressionNode> {
        self.where_expression.as_ref()
    }

    /// Replaces the scan target. Used by the time-suffix rewrite (stripping the suffix)
    /// and the plan splitter (addressing a single partition).
    pub fn set_table_name(&mut self, table_name: impl Into<String>) {
        self.table_name = table_name.into();
    }

    pub fn set_where_expression(&mut self, where_expression: ValueExpressionNode) {
        self.where_expression = Some(where_expression);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupByNode {
    pub select_list: Vec<SelectListItem>,
    pub group_expressions: Vec<ValueExpressionNode>,
    pub input: Box<QueryTreeNode>,
    is_partial_aggregation: bool,
}

impl GroupByNode {
    pub fn new(
        select_list: Vec<SelectListItem>,
        group_expressions: Vec<ValueExpressionNode>,
        input: QueryTreeNode,
    ) -> Self {
        Self {
            select_list,
            group_expressions,
            input: Box::new(input),
            is_partial_aggregation: false,
        }
    }

    pub fn is_partial_aggregation(&self) -> bool {
        self.is_partial_aggregation
    }

    /// Marks this GROUP BY as a per-shard partial aggregation. Partial aggregations emit
    /// accumulator state instead of finalized values.
    pub fn set_is_partial_aggregation(&mut self, is_partial: bool) {
        self.is_partial_aggregation = is_partial;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescribeTableNode {
    pub table_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Cross,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinNode {
    pub join_type: JoinType,
    pub select_list: Vec<SelectListItem>,
    pub where_expression: Option<ValueExpressionNode>,
    pub join_condition: Option<ValueExpressionNode>,
    pub base_table: Box<QueryTreeNode>,
    pub joined_table: Box<QueryTreeNode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartType {
    Area,
    Bar,
    Line,
    Points,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DrawStatementNode {
    pub chart_type: ChartType,
    pub input_tables: Vec<QueryTreeNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartStatementNode {
    pub draw_statements: Vec<DrawStatementNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionNode {
    pub name: String,
    pub children: Vec<QueryTreeNode>,
}

impl QueryTreeNode {
    /// The direct children of this node, in planning order.
    pub fn children(&self) -> Vec<&QueryTreeNode> {
        match self {
            QueryTreeNode::Limit(node) => vec![&node.input],
            QueryTreeNode::SelectExpression(_) => Vec::new(),
            QueryTreeNode::Subquery(node) => vec![&node.subquery],
            QueryTreeNode::OrderBy(node) => vec![&node.input],
            QueryTreeNode::SequentialScan(_) => Vec::new(),
            QueryTreeNode::GroupBy(node) => vec![&node.input],
            QueryTreeNode::ShowTables => Vec::new(),
            QueryTreeNode::DescribeTable(_) => Vec::new(),
            QueryTreeNode::Join(node) => vec![&node.base_table, &node.joined_table],
            QueryTreeNode::ChartStatement(node) => node
                .draw_statements
                .iter()
                .flat_map(|draw| draw.input_tables.iter())
                .collect(),
            QueryTreeNode::Extension(node) => node.children.iter().collect(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut QueryTreeNode> {
        match self {
            QueryTreeNode::Limit(node) => vec![&mut node.input],
            QueryTreeNode::SelectExpression(_) => Vec::new(),
            QueryTreeNode::Subquery(node) => vec![&mut node.subquery],
            QueryTreeNode::OrderBy(node) => vec![&mut node.input],
            QueryTreeNode::SequentialScan(_) => Vec::new(),
            QueryTreeNode::GroupBy(node) => vec![&mut node.input],
            QueryTreeNode::ShowTables => Vec::new(),
            QueryTreeNode::DescribeTable(_) => Vec::new(),
            QueryTreeNode::Join(node) => vec![&mut node.base_table, &mut node.joined_table],
            QueryTreeNode::ChartStatement(node) => node
                .draw_statements
                .iter_mut()
                .flat_map(|draw| draw.input_tables.iter_mut())
                .collect(),
            QueryTreeNode::Extension(node) => node.children.iter_mut().collect(),
        }
    }

    pub fn num_children(&self) -> usize {
        self.children().len()
    }

    /// Clones the entire subtree. Shards produced from deep copies share no state.
    pub fn deep_copy(&self) -> QueryTreeNode {
        self.clone()
    }

    /// All sequential scans reachable from this node, in traversal order.
    pub fn sequential_scans(&self) -> Vec<&SequentialScanNode> {
        let mut scans = Vec::new();
        self.collect_scans(&mut scans);
        scans
    }

    fn collect_scans<'a>(&'a self, scans: &mut Vec<&'a SequentialScanNode>) {
        if let QueryTreeNode::SequentialScan(scan) = self {
            scans.push(scan);
        }
        for child in self.children() {
            child.collect_scans(scans);
        }
    }

    /// The first sequential scan reachable from this node, mutably. Used by the plan
    /// splitter to rewrite the scan target of a shard copy.
    pub fn first_sequential_scan_mut(&mut self) -> Option<&mut SequentialScanNode> {
        if let QueryTreeNode::SequentialScan(scan) = self {
            return Some(scan);
        }
        for child in self.children_mut() {
            if let Some(scan) = child.first_sequential_scan_mut() {
                return Some(scan);
            }
        }
        None
    }
}

impl Display for QueryTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryTreeNode::Limit(node) => {
                write!(f, "(limit {} {} {})", node.limit, node.offset, node.input)
            }
            QueryTreeNode::SelectExpression(node) => {
                write!(f, "(select {})", format_select_list(&node.select_list))
            }
            QueryTreeNode::Subquery(node) => {
                write!(f, "(subquery {} {})", format_select_list(&node.select_list), node.subquery)
            }
            QueryTreeNode::OrderBy(node) => {
                write!(f, "(order-by")?;
                for spec in &node.sort_specs {
                    let direction = if spec.descending { "desc" } else { "asc" };
                    write!(f, " ({} {})", spec.expression, direction)?;
                }
                write!(f, " {})", node.input)
            }
            QueryTreeNode::SequentialScan(node) => write!(f, "(seqscan {:?})", node.table_name),
            QueryTreeNode::GroupBy(node) => {
                let partial = if node.is_partial_aggregation { "partial-" } else { "" };
                write!(
                    f,
                    "({partial}group-by {} [{}] {})",
                    format_select_list(&node.select_list),
                    node.group_expressions
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    node.input
                )
            }
            QueryTreeNode::ShowTables => write!(f, "(show-tables)"),
            QueryTreeNode::DescribeTable(node) => write!(f, "(describe {:?})", node.table_name),
            QueryTreeNode::Join(node) => write!(
                f,
                "({:?}-join {} {})",
                node.join_type, node.base_table, node.joined_table
            ),
            QueryTreeNode::ChartStatement(node) => {
                write!(f, "(chart {} draw statements)", node.draw_statements.len())
            }
            QueryTreeNode::Extension(node) => write!(f, "(extension {:?})", node.name),
        }
    }
}

fn format_select_list(select_list: &[SelectListItem]) -> String {
    select_list
        .iter()
        .map(|item| item.column_name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A value expression within a statement: function calls, column references, literals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueExpressionNode {
    Call {
        function: String,
        args: Vec<ValueExpressionNode>,
    },
    ColumnReference(String),
    Literal(Value),
}

impl ValueExpressionNode {
    pub fn call(function: impl Into<String>, args: Vec<ValueExpressionNode>) -> Self {
        Self::Call {
            function: function.into(),
            args,
        }
    }

    pub fn column(name: impl Into<String>) -> Self {
        Self::ColumnReference(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }
}

impl Display for ValueExpressionNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueExpressionNode::Call { function, args } => {
                write!(f, "{function}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ValueExpressionNode::ColumnReference(name) => write!(f, "{name}"),
            ValueExpressionNode::Literal(value) => write!(f, "{value}"),
        }
    }
}
