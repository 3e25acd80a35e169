pub mod cluster;
pub mod config;
pub mod error;
pub mod future;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use cluster::{Cluster, ClusterEvent, ClusterState, ClusterStatus, JobOutcome};
pub use config::{ClusterConfig, InvokePolicy, NodeParams};
pub use error::{CancelError, DispatchError, JobError, Result};
pub use future::{FutureStatus, JobFuture};
pub use scheduler::{JobId, Task};
pub use worker::{LocalWorker, WorkerEvents, WorkerId, WorkerNode, WorkerState};
