use std::collections::{BTreeMap, BTreeSet};

use crate::flow::Flow;
use crate::state::ExecutionState;

/// 一次DAG遍历的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagProgress {
    /// 所有父节点都已成功, 可以派发
    pub eligible: Vec<String>,
    /// 上游失败或取消, 永远不会运行
    pub blocked: Vec<String>,
    /// 没有节点能继续推进时给出执行的最终状态
    pub outcome: Option<ExecutionState>,
}

pub fn evaluate(flow: &Flow, states: &BTreeMap<String, ExecutionState>) -> DagProgress {
    let state_of = |id: &str| states.get(id).copied().unwrap_or_default();

    let mut blocked: BTreeSet<&str> = BTreeSet::new();
    loop {
        let mut changed = false;
        for node in &flow.nodes {
            let id = node.id();
            if blocked.contains(id) || state_of(id) != ExecutionState::Created {
                continue;
            }
            let dead_parent = flow.parents(id).into_iter().any(|parent| {
                blocked.contains(parent)
                    || matches!(
                        state_of(parent),
                        ExecutionState::Failed | ExecutionState::Cancelled
                    )
            });
            if dead_parent {
                blocked.insert(id);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let eligible: Vec<String> = flow
        .executor_nodes()
        .filter(|node| state_of(&node.id) == ExecutionState::Created)
        .filter(|node| !blocked.contains(node.id.as_str()))
        .filter(|node| {
            flow.parents(&node.id)
                .into_iter()
                .all(|parent| state_of(parent) == ExecutionState::Success)
        })
        .map(|node| node.id.clone())
        .collect();

    let progressing = flow
        .nodes
        .iter()
        .any(|node| !state_of(node.id()).is_terminal() && !blocked.contains(node.id()));

    let outcome = if progressing {
        None
    } else if flow
        .nodes
        .iter()
        .all(|node| state_of(node.id()) == ExecutionState::Success)
    {
        Some(ExecutionState::Success)
    } else {
        Some(ExecutionState::Failed)
    };

    DagProgress {
        eligible,
        blocked: blocked.into_iter().map(str::to_string).collect(),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ExecutorNode, FlowNode};
    use ExecutionState::*;

    fn join_flow() -> Flow {
        // t -> a, t -> b, (a, b) -> c, c -> d
        Flow::new("f", "join")
            .with_node(FlowNode::trigger("t"))
            .with_node(FlowNode::Executor(ExecutorNode::new("a", "shell")))
            .with_node(FlowNode::Executor(ExecutorNode::new("b", "shell")))
            .with_node(FlowNode::Executor(ExecutorNode::new("c", "shell")))
            .with_node(FlowNode::Executor(ExecutorNode::new("d", "shell")))
            .with_edge("t", "a")
            .with_edge("t", "b")
            .with_edge("a", "c")
            .with_edge("b", "c")
            .with_edge("c", "d")
    }

    /// 触发节点t总是成功, 参数依次是a, b, c, d的状态
    fn states(nodes: [ExecutionState; 4]) -> BTreeMap<String, ExecutionState> {
        std::iter::once(("t", Success))
            .chain(["a", "b", "c", "d"].into_iter().zip(nodes))
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_parallel_branches_start_together() {
        let flow = join_flow();
        let progress = evaluate(
            &flow,
            &states([Created, Created, Created, Created]),
        );
        assert_eq!(progress.eligible, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(progress.outcome, None);
    }

    #[test]
    fn test_join_waits_for_all_parents() {
        let flow = join_flow();
        let progress = evaluate(
            &flow,
            &states([Success, Running, Created, Created]),
        );
        assert!(progress.eligible.is_empty());
        assert_eq!(progress.outcome, None);
    }

    #[test]
    fn test_failed_parent_blocks_join_transitively() {
        let flow = join_flow();
        let progress = evaluate(
            &flow,
            &states([Success, Failed, Created, Created]),
        );
        assert!(progress.eligible.is_empty());
        assert_eq!(progress.blocked, vec!["c".to_string(), "d".to_string()]);
        assert_eq!(progress.outcome, Some(Failed));
    }

    #[test]
    fn test_failed_branch_does_not_stop_running_sibling() {
        let flow = join_flow();
        let progress = evaluate(
            &flow,
            &states([Running, Failed, Created, Created]),
        );
        assert_eq!(progress.outcome, None);
    }

    #[test]
    fn test_all_success() {
        let flow = join_flow();
        let progress = evaluate(
            &flow,
            &states([Success, Success, Success, Success]),
        );
        assert_eq!(progress.outcome, Some(Success));
    }
}
