pub mod dag;
pub mod events;
pub mod execution;
pub mod flow;
pub mod repositories;
pub mod schedule;
pub mod state;

pub use dag::{evaluate, DagProgress};
pub use events::{DomainEvent, EventPublisher, EventRecord};
pub use execution::{Execution, Task};
pub use flow::{
    ExecutorNode, Flow, FlowEdge, FlowNode, TriggerNode, ValidationIssue, MAX_FLOW_NODES,
};
pub use jobflow_core::{SchedulerError, SchedulerResult};
pub use repositories::*;
pub use schedule::{RefType, Schedule, ScheduleDelay, ScheduleOption, ScheduleType};
pub use state::{next_state, transition, ExecutionState, StateEvent, Transition};
