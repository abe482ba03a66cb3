pub mod app_config;
pub mod broker_worker;
pub mod observability;

pub use app_config::AppConfig;
pub use broker_worker::{BrokerConfig, WorkerConfig};
pub use observability::{LoggingConfig, MetricsConfig};
