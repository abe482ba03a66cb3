//! Metrics collector for the scheduling platform
//!
//! Thin wrapper over the `metrics` facade. Without an installed recorder every
//! call is a no-op, so components can record unconditionally.

use metrics::{counter, gauge, histogram};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a schedule firing an execution
    pub fn record_trigger(&self, schedule_type: &str) {
        counter!("jobflow_triggers_total", "schedule_type" => schedule_type.to_string())
            .increment(1);
    }

    /// Record the outcome of a dispatch attempt: accepted, rejected or failed
    pub fn record_dispatch(&self, outcome: &str) {
        counter!("jobflow_dispatches_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_undispatchable(&self) {
        counter!("jobflow_undispatchable_total").increment(1);
    }

    pub fn record_feedback(&self, status: &str) {
        counter!("jobflow_feedback_total", "status" => status.to_string()).increment(1);
    }

    pub fn record_task_lost(&self) {
        counter!("jobflow_tasks_lost_total").increment(1);
    }

    pub fn record_execution_finished(&self, state: &str, duration_seconds: f64) {
        counter!("jobflow_executions_finished_total", "state" => state.to_string()).increment(1);
        histogram!("jobflow_execution_duration_seconds").record(duration_seconds);
        debug!(state, duration_seconds, "execution finished");
    }

    pub fn set_alive_workers(&self, count: usize) {
        gauge!("jobflow_alive_workers").set(count as f64);
    }

    pub fn set_worker_available_queue(&self, worker_id: &str, available: u32) {
        gauge!("jobflow_worker_available_queue", "worker_id" => worker_id.to_string())
            .set(available as f64);
    }

    pub fn record_sweep_duration(&self, seconds: f64) {
        histogram!("jobflow_schedule_sweep_duration_seconds").record(seconds);
    }

    /// Worker side: task finished inside the runtime
    pub fn record_task_execution(&self, executor: &str, status: &str, duration_seconds: f64) {
        counter!(
            "jobflow_worker_task_executions_total",
            "executor" => executor.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!("jobflow_worker_task_duration_seconds").record(duration_seconds);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        gauge!("jobflow_worker_queue_depth").set(depth as f64);
    }
}
