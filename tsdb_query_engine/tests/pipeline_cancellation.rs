// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Failure propagation and teardown: a fatal shard error surfaces through the cursor,
//! cancels its peers, and leaves the scheduler's running counter where it started.

use pretty_assertions::assert_eq;

use tsdb_query_engine::qtree::{
    GroupByNode, QueryTreeNode, SelectListItem, SequentialScanNode, ValueExpressionNode,
};
use tsdb_query_engine::ErrorKind;

use mock_cluster::{
    build_cluster, event_rows, events_schema, PartitionSpec, TableSpec, LOCAL_HOST,
};

mod mock_cluster;

fn count_all(table: &str) -> QueryTreeNode {
    QueryTreeNode::GroupBy(GroupByNode::new(
        vec![SelectListItem::with_alias(
            ValueExpressionNode::call("count", vec![]),
            "total",
        )],
        vec![],
        QueryTreeNode::SequentialScan(SequentialScanNode::new(
            table,
            vec![
                SelectListItem::new(ValueExpressionNode::column("time")),
                SelectListItem::new(ValueExpressionNode::column("value")),
            ],
            None,
        )),
    ))
}

#[test]
fn fatal_shard_error_cancels_the_statement() -> Result<(), Box<dyn std::error::Error>> {
    // Four shards; the first one lands on a replica that no longer serves the table, so
    // its dispatch fails with TableNotFound before the others finish.
    let cluster = build_cluster(vec![TableSpec {
        name: "events",
        schema: events_schema(),
        window_micros: 100,
        partitions: vec![
            PartitionSpec {
                window_start: 0,
                hosts: vec!["h_stale:7001"],
                rows: event_rows(&[(10, 1)]),
            },
            PartitionSpec {
                window_start: 100,
                hosts: vec!["h2:7001"],
                rows: event_rows(&[(110, 2)]),
            },
            PartitionSpec {
                window_start: 200,
                hosts: vec!["h3:7001"],
                rows: event_rows(&[(210, 3)]),
            },
            PartitionSpec {
                window_start: 300,
                hosts: vec!["h4:7001"],
                rows: event_rows(&[(310, 4)]),
            },
        ],
        absent_on: vec!["h_stale:7001"],
    }]);

    assert_eq!(cluster.scheduler.running_count(), 0);

    let plan = cluster.plan(count_all("events"));
    let mut cursor = cluster.scheduler.execute(&plan, 0)?;
    assert_eq!(cluster.scheduler.running_count(), 1);

    let error = futures::executor::block_on(cursor.drain()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::TableNotFound);

    // The error was not retried on another replica and flagged the execution context so
    // outstanding shards stop.
    assert!(cursor.execution_context().is_cancelled());

    drop(cursor);
    assert_eq!(cluster.scheduler.running_count(), 0);

    Ok(())
}

#[test]
fn dropping_the_cursor_cancels_execution() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = build_cluster(vec![TableSpec {
        name: "events",
        schema: events_schema(),
        window_micros: 100,
        partitions: vec![PartitionSpec {
            window_start: 0,
            hosts: vec![LOCAL_HOST],
            rows: event_rows(&[(10, 1), (20, 2)]),
        }],
        absent_on: vec![],
    }]);

    let plan = cluster.plan(count_all("events"));
    let cursor = cluster.scheduler.execute(&plan, 0)?;
    assert_eq!(cluster.scheduler.running_count(), 1);

    let ectx = cursor.execution_context().clone();
    assert!(!ectx.is_cancelled());

    // Abandoning the cursor before draining tears the pipeline down.
    drop(cursor);
    assert!(ectx.is_cancelled());
    assert_eq!(cluster.scheduler.running_count(), 0);

    Ok(())
}

#[test]
fn exhausted_replicas_cancel_peers_too() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = build_cluster(vec![TableSpec {
        name: "events",
        schema: events_schema(),
        window_micros: 100,
        partitions: vec![
            PartitionSpec {
                window_start: 0,
                hosts: vec![LOCAL_HOST],
                rows: event_rows(&[(10, 1)]),
            },
            PartitionSpec {
                window_start: 100,
                hosts: vec!["h2:7001"],
                rows: event_rows(&[(110, 2)]),
            },
        ],
        absent_on: vec![],
    }]);

    // Exhaust the only replica of the second shard.
    cluster.transport.fail_next("h2:7001", 1);

    let plan = cluster.plan(count_all("events"));
    let mut cursor = cluster.scheduler.execute(&plan, 0)?;
    let error = futures::executor::block_on(cursor.drain()).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ShardDispatchFailed);
    assert!(cursor.execution_context().is_cancelled());

    // A second pull after the error reports cancellation rather than resuming.
    let followup = futures::executor::block_on(cursor.next()).unwrap_err();
    assert_eq!(followup.kind(), ErrorKind::Cancelled);

    Ok(())
}
