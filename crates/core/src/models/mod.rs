pub mod dispatch;
pub mod message;
pub mod node;

pub use dispatch::{DispatchOption, InvocationParams, LoadBalanceType, TagCondition, TagFilter};
pub use message::{
    CancelTaskRequest, CancelTaskResponse, DispatchTaskRequest, DispatchTaskResponse,
    FeedbackStatus, HeartbeatRequest, HeartbeatResponse, PingResponse, RegisterRequest,
    RegisterResponse, RejectReason, TaskFeedback, TaskKind,
};
pub use node::{Node, NodeRole, Worker, WorkerMetric};
