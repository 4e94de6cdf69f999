// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Indicates that a table referenced by the query does not resolve against the
    /// partition map or the transaction's table provider.
    ///
    /// This error is not recoverable and is surfaced to the caller immediately.
    TableNotFound,

    /// Indicates that a pipelining invariant was violated: a pipelined subtree without a
    /// sequential scan, a scan that already addresses a specific partition, or a table
    /// without a partitioner.
    ///
    /// This error is not recoverable and indicates a bug in the planner.
    IllegalState,

    /// Indicates a generic execution failure: a query tree variant the scheduler cannot
    /// build, or a runtime error reported by a remote shard.
    RuntimeError,

    /// Indicates that a remote shard could not be dispatched to any of its replica hosts.
    ///
    /// Individual transport failures are retried on the next replica; this kind is
    /// surfaced only after the host list is exhausted, and cancels peer shards.
    ShardDispatchFailed,

    /// Indicates that the value-expression compiler rejected an expression.
    ///
    /// This error is not recoverable and is surfaced to the caller immediately.
    CompilationError,

    /// Indicates a failure to encode or decode a shard query or row batch on the wire.
    SerializationError,

    /// Indicates that execution was cancelled, either by the caller dropping the result
    /// cursor or by a peer shard failing first.
    Cancelled,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::TableNotFound => write!(f, "table not found"),
            ErrorKind::IllegalState => write!(f, "illegal scheduler state"),
            ErrorKind::RuntimeError => write!(f, "runtime error"),
            ErrorKind::ShardDispatchFailed => write!(f, "shard dispatch failed"),
            ErrorKind::CompilationError => write!(f, "expression compilation error"),
            ErrorKind::SerializationError => write!(f, "serialization error"),
            ErrorKind::Cancelled => write!(f, "query cancelled"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
