#[cfg(test)]
mod executors_tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::watch;

    use jobflow_core::models::{DispatchTaskRequest, TaskKind};
    use jobflow_core::SchedulerResult;

    use crate::executors::{run_task, ExecutorRegistry, ShellExecutor, TaskContext, TaskExecutor};

    struct SumExecutor;

    #[async_trait]
    impl TaskExecutor for SumExecutor {
        fn name(&self) -> &str {
            "sum"
        }

        async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
            let numbers = context.input.clone().unwrap_or(Value::Null);
            let total: i64 = numbers
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            Ok(json!(total))
        }

        async fn sharding(&self, context: &TaskContext) -> SchedulerResult<Vec<Value>> {
            let numbers = context.params["numbers"].as_array().cloned().unwrap_or_default();
            Ok(numbers.chunks(2).map(|chunk| json!(chunk)).collect())
        }

        async fn reduce(
            &self,
            _context: &TaskContext,
            results: Vec<Value>,
        ) -> SchedulerResult<Value> {
            Ok(json!(results.iter().filter_map(Value::as_i64).sum::<i64>()))
        }
    }

    fn context(kind: TaskKind, params: Value, input: Option<Value>) -> TaskContext {
        let request = DispatchTaskRequest {
            task_id: "task-1".to_string(),
            execution_id: "exec-1".to_string(),
            job_id: "job-1".to_string(),
            executor: "sum".to_string(),
            kind,
            params,
            input,
            broker_url: "http://broker".to_string(),
            timeout_ms: 1_000,
        };
        let (_tx, rx) = watch::channel(false);
        TaskContext::new(&request, rx)
    }

    #[tokio::test]
    async fn test_map_reduce_roles() {
        let executor = SumExecutor;

        let split = context(TaskKind::Split, json!({"numbers": [1, 2, 3, 4, 5]}), None);
        let shards = run_task(&executor, &split).await.unwrap();
        assert_eq!(shards, json!([[1, 2], [3, 4], [5]]));

        let map = context(TaskKind::Map, Value::Null, Some(json!([3, 4])));
        assert_eq!(run_task(&executor, &map).await.unwrap(), json!(7));

        let reduce = context(TaskKind::Reduce, Value::Null, Some(json!([3, 7, 5])));
        assert_eq!(run_task(&executor, &reduce).await.unwrap(), json!(15));
    }

    #[tokio::test]
    async fn test_reduce_rejects_non_array_input() {
        let reduce = context(TaskKind::Reduce, Value::Null, Some(json!({"a": 1})));
        assert!(run_task(&SumExecutor, &reduce).await.is_err());
    }

    #[test]
    fn test_registry_lists_builtin_executors() {
        let registry = ExecutorRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["http", "shell"]);
        assert!(registry.contains("shell"));
        assert!(registry.get("python").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_success_and_failure() {
        let executor = ShellExecutor::new();

        let ok = context(
            TaskKind::Normal,
            json!({"command": "sh", "args": ["-c", "echo hello"]}),
            None,
        );
        let result = executor.execute(&ok).await.unwrap();
        assert_eq!(result["stdout"], json!("hello"));
        assert_eq!(result["exitCode"], json!(0));

        let failing = context(
            TaskKind::Normal,
            json!({"command": "sh", "args": ["-c", "echo boom >&2; exit 3"]}),
            None,
        );
        let error = executor.execute(&failing).await.unwrap_err();
        assert!(error.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_shell_executor_rejects_bad_params() {
        let bad = context(TaskKind::Normal, json!({"args": []}), None);
        assert!(ShellExecutor::new().execute(&bad).await.is_err());
    }
}
