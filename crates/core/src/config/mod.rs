pub mod models;

pub use models::{AppConfig, BrokerConfig, LoggingConfig, MetricsConfig, WorkerConfig};
