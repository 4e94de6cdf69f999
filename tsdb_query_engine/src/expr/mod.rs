// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compilation of value-expression trees into executable form.
//!
//! The compiler is owned by the transaction; the scheduler calls it for every select
//! list, WHERE expression, sort spec, and join condition it builds. Compilation resolves
//! function names and checks arities, so execution only fails on data-dependent
//! conditions.

use serde_json::Value;

use crate::exec::aggregate::AggregateFunction;
use crate::exec::Row;
use crate::qtree::ValueExpressionNode;
use crate::txn::Transaction;
use crate::ErrorKind;

mod functions;

pub use functions::ScalarFunction;

/// A compiled, executable value expression.
#[derive(Clone, Debug)]
pub struct ValueExpression {
    instr: Instr,
}

#[derive(Clone, Debug)]
enum Instr {
    Literal(Value),
    ColumnReference(String),
    Call {
        function: ScalarFunction,
        args: Vec<Instr>,
    },
}

impl ValueExpression {
    /// Evaluates the expression against a single input row.
    pub fn evaluate(&self, row: &Row) -> crate::Result<Value> {
        evaluate_instr(&self.instr, row)
    }
}

fn evaluate_instr(instr: &Instr, row: &Row) -> crate::Result<Value> {
    match instr {
        Instr::Literal(value) => Ok(value.clone()),
        Instr::ColumnReference(name) => match row.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(ErrorKind::RuntimeError.with_message(format!("column not found: {name}"))),
        },
        Instr::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate_instr(arg, row))
                .collect::<crate::Result<Vec<_>>>()?;
            function.evaluate(&args)
        }
    }
}

/// Builds executable value expressions for a transaction.
pub trait QueryCompiler: Send + Sync {
    fn build_value_expression(
        &self,
        txn: &Transaction,
        node: &ValueExpressionNode,
    ) -> crate::Result<ValueExpression>;
}

/// The stock compiler: scalar functions from [`ScalarFunction`], no user-defined
/// extensions.
#[derive(Default)]
pub struct DefaultCompiler;

impl DefaultCompiler {
    pub fn new() -> Self {
        Self
    }

    fn compile(&self, node: &ValueExpressionNode) -> crate::Result<Instr> {
        match node {
            ValueExpressionNode::Literal(value) => Ok(Instr::Literal(value.clone())),
            ValueExpressionNode::ColumnReference(name) => {
                Ok(Instr::ColumnReference(name.clone()))
            }
            ValueExpressionNode::Call { function, args } => {
                if AggregateFunction::from_name(function).is_some() {
                    return Err(ErrorKind::CompilationError.with_message(format!(
                        "aggregate function {function} is not allowed in this context"
                    )));
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
                    .map(|arg| self.compile(arg))
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(Instr::Call {
                    function: scalar,
                    args,
                })
            }
        }
    }
}

impl QueryCompiler for DefaultCompiler {
    fn build_value_expression(
        &self,
        _txn: &Transaction,
        node: &ValueExpressionNode,
    ) -> crate::Result<ValueExpression> {
        Ok(ValueExpression {
            instr: self.compile(node)?,
        })
    }
}
