pub mod event_bus;
pub mod id_generator;
pub mod in_memory_repository;
pub mod observability;
pub mod resource_monitor;

pub use event_bus::BroadcastEventPublisher;
pub use id_generator::UuidIdGenerator;
pub use in_memory_repository::{
    InMemoryExecutionRepository, InMemoryFlowRepository, InMemoryScheduleDelayRepository,
    InMemoryScheduleRepository, InMemoryTaskRepository,
};
pub use observability::MetricsCollector;
pub use resource_monitor::{ResourceMonitor, ResourceSnapshot};
