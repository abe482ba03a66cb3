pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod rpc;
pub mod traits;

pub use config::{AppConfig, BrokerConfig, LoggingConfig, MetricsConfig, WorkerConfig};
pub use errors::{SchedulerError, SchedulerResult};
pub use lifecycle::{ServerLifecycle, ServerState};
pub use logging::StructuredLogger;
pub use rpc::RpcResponse;
pub use traits::{BrokerClient, NodeClient};

/// 当前时间的毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
