// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::Deserialize;

/// Default bound on concurrently running shards per pipelined expression.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Scheduler tuning, deserialized from the node's configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of shards a pipelined expression dispatches in parallel. Further
    /// shards wait until a running shard completes.
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}
