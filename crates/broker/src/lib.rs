pub mod broker;
pub mod calculator;
pub mod client;
pub mod dispatcher;
pub mod execution_manager;
pub mod failure_detector;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod strategies;

#[cfg(test)]
mod strategies_test;

pub use broker::{Broker, BrokerBuilder, BrokerStores};
pub use calculator::{CalculatorRegistry, ScheduleCalculator};
pub use client::HttpNodeClient;
pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use execution_manager::{ExecutionManager, ExecutionManagerConfig, TriggerRequest};
pub use failure_detector::FailureDetector;
pub use registry::NodeRegistry;
pub use rpc::{create_routes, BrokerState};
pub use scheduler::{ScheduleSweeper, SweepReport};
pub use strategies::LoadBalancer;
