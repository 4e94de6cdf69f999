// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde_json::Value;

use crate::{value, ErrorKind};

/// The scalar function set known to the default compiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarFunction {
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ScalarFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "logical_and" => Some(Self::LogicalAnd),
            "logical_or" => Some(Self::LogicalOr),
            "logical_not" => Some(Self::LogicalNot),
            "eq" => Some(Self::Equal),
            "neq" => Some(Self::NotEqual),
            "lt" => Some(Self::LessThan),
            "lte" => Some(Self::LessThanOrEqual),
            "gt" => Some(Self::GreaterThan),
            "gte" => Some(Self::GreaterThanOrEqual),
            "add" => Some(Self::Add),
            "sub" => Some(Self::Subtract),
            "mul" => Some(Self::Multiply),
            "div" => Some(Self::Divide),
            _ => None,
        }
    }

    /// The argument count this function expects, checked at compile time.
    pub fn arity(&self) -> usize {
        match self {
            Self::LogicalNot => 1,
            _ => 2,
        }
    }

    pub fn evaluate(&self, args: &[Value]) -> crate::Result<Value> {
        match self {
            Self::LogicalAnd => Ok(Value::Bool(
                value::is_truthy(&args[0]) && value::is_truthy(&args[1]),
            )),
            Self::LogicalOr => Ok(Value::Bool(
                value::is_truthy(&args[0]) || value::is_truthy(&args[1]),
            )),
            Self::LogicalNot => Ok(Value::Bool(!value::is_truthy(&args[0]))),
            Self::Equal => Ok(Value::Bool(args[0] == args[1])),
            Self::NotEqual => Ok(Value::Bool(args[0] != args[1])),
            Self::LessThan => self.compare(args, |o| o == std::cmp::Ordering::Less),
            Self::LessThanOrEqual => self.compare(args, |o| o != std::cmp::Ordering::Greater),
            Self::GreaterThan => self.compare(args, |o| o == std::cmp::Ordering::Greater),
            Self::GreaterThanOrEqual => self.compare(args, |o| o != std::cmp::Ordering::Less),
            Self::Add => self.arithmetic(args, |l, r| l + r),
            Self::Subtract => self.arithmetic(args, |l, r| l - r),
            Self::Multiply => self.arithmetic(args, |l, r| l * r),
            Self::Divide => {
                let divisor = value::as_f64(&args[1])?;
                if divisor == 0.0 {
                    return Err(ErrorKind::RuntimeError.with_message("division by zero"));
                }
                value::number(value::as_f64(&args[0])? / divisor)
            }
        }
    }

    fn compare(
        &self,
        args: &[Value],
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> crate::Result<Value> {
        // Comparisons against NULL are false rather than an error, so filters can run
        // over sparse rows.
        if args[0].is_null() || args[1].is_null() {
            return Ok(Value::Bool(false));
        }
        Ok(Value::Bool(accept(value::compare(&args[0], &args[1])?)))
    }

    fn arithmetic(&self, args: &[Value], apply: impl Fn(f64, f64) -> f64) -> crate::Result<Value> {
        let result = apply(value::as_f64(&args[0])?, value::as_f64(&args[1])?);
        // Integer inputs keep integer results, so group keys and timestamps survive
        // arithmetic unmangled.
        if let (Some(_), Some(_)) = (args[0].as_i64(), args[1].as_i64()) {
            if result.fract() == 0.0 && result.abs() < (i64::MAX as f64) {
                return Ok(Value::from(result as i64));
            }
        }
        value::number(result)
    }
}
