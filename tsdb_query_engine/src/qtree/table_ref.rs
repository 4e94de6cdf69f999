// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing of textual table references.
//!
//! Three forms are accepted:
//!
//! * `events`: a bare table key.
//! * `events.<begin>:<limit>`: a table key with a time-range suffix; endpoints are
//!   integer microsecond Unix timestamps. The suffix is syntactic sugar lifted into an
//!   explicit WHERE predicate by [`rewrite_table_time_suffix`](super::rewrite_table_time_suffix).
//! * `tsdb://<host>/<urlencoded-table>/<partition-hex>`: a partition-addressed scan
//!   produced by the plan splitter. The `localhost` host token is a marker; the remote
//!   executor resolves it against its own storage at dispatch.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use crate::{cluster::PartitionKey, ErrorKind};

/// Characters escaped when a table key is embedded as a URI path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// The parsed form of a textual table reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub table_key: String,
    pub host: Option<String>,
    pub partition_key: Option<PartitionKey>,
    pub timerange_begin: Option<i64>,
    pub timerange_limit: Option<i64>,
}

impl TableRef {
    /// Parses a textual table reference.
    pub fn parse(reference: &str) -> crate::Result<TableRef> {
        if reference.starts_with("tsdb://") {
            return Self::parse_partition_uri(reference);
        }

        // A time-range suffix is everything after the last dot, if it looks like
        // `<begin>:<limit>` with integer endpoints. Table keys may themselves contain
        // dots, so anything that doesn't match stays part of the key.
        if let Some((table_key, suffix)) = reference.rsplit_once('.') {
            if let Some((begin, limit)) = parse_time_suffix(suffix) {
                return Ok(TableRef {
                    table_key: table_key.to_string(),
                    host: None,
                    partition_key: None,
                    timerange_begin: begin,
                    timerange_limit: limit,
                });
            }
        }

        Ok(TableRef {
            table_key: reference.to_string(),
            host: None,
            partition_key: None,
            timerange_begin: None,
            timerange_limit: None,
        })
    }

    fn parse_partition_uri(reference: &str) -> crate::Result<TableRef> {
        let invalid = || {
            ErrorKind::RuntimeError
                .with_message(format!("invalid table reference: {reference}"))
        };

        let url = Url::parse(reference).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?.to_string();

        let segments: Vec<&str> = url.path_segments().ok_or_else(invalid)?.collect();
        let [table, partition] = segments.as_slice() else {
            return Err(invalid());
        };

        let table_key = percent_decode_str(table)
            .decode_utf8()
            .map_err(|_| invalid())?
            .into_owned();
        let partition_key = PartitionKey::from_hex(partition).map_err(|_| invalid())?;

        Ok(TableRef {
            table_key,
            host: Some(host),
            partition_key: Some(partition_key),
            timerange_begin: None,
            timerange_limit: None,
        })
    }

    /// Formats a partition-addressed scan URI with the `localhost` marker host.
    pub fn partition_uri(table_key: &str, partition: &PartitionKey) -> String {
        format!(
            "tsdb://localhost/{}/{}",
            utf8_percent_encode(table_key, PATH_SEGMENT),
            partition
        )
    }
}

/// Parses `<begin>:<limit>` where each endpoint is an optional integer. Returns `None`
/// if the suffix is not a time range at all (and so belongs to the table key).
fn parse_time_suffix(suffix: &str) -> Option<(Option<i64>, Option<i64>)> {
    let (begin, limit) = suffix.split_once(':')?;

    let parse_endpoint = |s: &str| -> Option<Option<i64>> {
        if s.is_empty() {
            Some(None)
        } else if s.chars().all(|c| c.is_ascii_digit()) {
            s.parse::<i64>().ok().map(Some)
        } else {
            None
        }
    };

    let begin = parse_endpoint(begin)?;
    let limit = parse_endpoint(limit)?;
    if begin.is_none() && limit.is_none() {
        return None;
    }
    Some((begin, limit))
}
