use tracing::{debug, info, warn};

/// 关键生命周期事件的结构化日志, 字段名在各组件间保持一致
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn execution_triggered(execution_id: &str, ref_id: &str, trigger_at: i64) {
        info!(
            target: "jobflow::events",
            event = "execution_triggered",
            execution_id,
            ref_id,
            trigger_at,
            "触发执行"
        );
    }

    pub fn execution_finished(execution_id: &str, state: &str, cause: Option<&str>) {
        info!(
            target: "jobflow::events",
            event = "execution_finished",
            execution_id,
            state,
            cause = cause.unwrap_or(""),
            "执行结束"
        );
    }

    pub fn task_dispatched(task_id: &str, worker_id: &str, attempt: u32) {
        info!(
            target: "jobflow::events",
            event = "task_dispatched",
            task_id,
            worker_id,
            attempt,
            "任务已派发"
        );
    }

    pub fn feedback_applied(task_id: &str, worker_id: &str, status: &str) {
        debug!(
            target: "jobflow::events",
            event = "feedback_applied",
            task_id,
            worker_id,
            status,
            "应用任务反馈"
        );
    }

    pub fn transition_ignored(entity: &str, id: &str, state: &str, event: &str) {
        debug!(
            target: "jobflow::events",
            event = "transition_ignored",
            entity,
            id,
            state,
            trigger = event,
            "终态实体忽略状态变更"
        );
    }

    pub fn node_offline(server_id: &str, last_heartbeat_at: i64) {
        warn!(
            target: "jobflow::events",
            event = "node_offline",
            server_id,
            last_heartbeat_at,
            "节点心跳超时, 标记为离线"
        );
    }
}
