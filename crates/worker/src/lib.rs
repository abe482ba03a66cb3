pub mod broker_client;
pub mod executors;
pub mod heartbeat;
pub mod rpc;
pub mod runtime;
pub mod service;

#[cfg(test)]
mod executors_test;

pub use broker_client::HttpBrokerClient;
pub use executors::{
    ExecutorRegistry, HttpExecutor, HttpTaskParams, ShellExecutor, ShellTaskParams, TaskContext,
    TaskExecutor,
};
pub use heartbeat::{BrokerConnector, WorkerIdentity};
pub use rpc::{create_routes, WorkerState};
pub use runtime::{ConcurrencyLimiter, FeedbackReporter, TaskOutcome, TaskQueue, WorkerRuntime};
pub use service::{WorkerService, WorkerServiceBuilder};
