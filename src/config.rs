use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::worker::WorkerId;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// How `submit_many` treats a job that fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokePolicy {
    /// Wait for every job and report each outcome, failures included.
    #[default]
    IgnoreFailures,
    /// Stop at the first failure, cancel the rest and return the error.
    FailFast,
}

/// Connection parameters for one worker node. Launching the node is outside
/// this crate; the registry only stores what a launcher needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeParams {
    pub id: WorkerId,
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Name of the shell used to launch the remote worker (e.g. "ssh").
    pub shell: String,
    /// Concurrent job limit; 0 means "ask the node".
    pub threads: usize,
    pub exec_root: String,
    pub file_root: String,
}

impl NodeParams {
    pub fn new(id: WorkerId, host: impl Into<String>, threads: usize) -> Self {
        Self {
            id,
            host: host.into(),
            threads,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Bound of the queue for externally submitted jobs.
    pub normal_capacity: usize,
    /// Bound of the queue for requeued jobs.
    pub priority_capacity: usize,
    /// Free slots (across both queues) a normal submission must leave.
    pub guaranteed_capacity: usize,
    /// How long the scheduler sleeps when no node or job is available.
    pub poll_interval_ms: u64,
    pub invoke_policy: InvokePolicy,
    /// Fills blank fields of registered nodes.
    pub node_defaults: NodeParams,
    pub nodes: Vec<NodeParams>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            normal_capacity: DEFAULT_QUEUE_CAPACITY,
            priority_capacity: DEFAULT_QUEUE_CAPACITY,
            guaranteed_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            invoke_policy: InvokePolicy::default(),
            node_defaults: NodeParams::default(),
            nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.normal_capacity == 0 || self.priority_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        let total = self.normal_capacity + self.priority_capacity;
        if self.guaranteed_capacity > total {
            return Err(DispatchError::InvalidConfig(format!(
                "guaranteed capacity {} exceeds combined queue capacity {}",
                self.guaranteed_capacity, total
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(DispatchError::InvalidConfig(
                "poll interval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_queue_capacity(mut self, normal: usize, priority: usize) -> Self {
        self.normal_capacity = normal;
        self.priority_capacity = priority;
        self
    }

    pub fn with_guaranteed_capacity(mut self, guaranteed: usize) -> Self {
        self.guaranteed_capacity = guaranteed;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_invoke_policy(mut self, policy: InvokePolicy) -> Self {
        self.invoke_policy = policy;
        self
    }

    pub fn with_node_defaults(mut self, defaults: NodeParams) -> Self {
        self.node_defaults = defaults;
        self
    }

    pub fn with_node(mut self, params: NodeParams) -> Self {
        self.nodes.push(params);
        self
    }
}
