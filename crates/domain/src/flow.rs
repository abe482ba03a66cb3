//! 工作流定义(DAG)
//!
//! 节点是封闭的标签联合: 触发节点或执行器节点。每个节点自行校验并以
//! [`ValidationIssue`] 报告问题, 可抑制的问题不阻止工作流运行。

use std::collections::{HashMap, HashSet, VecDeque};

use jobflow_core::models::DispatchOption;
use jobflow_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

pub const MAX_FLOW_NODES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub node_id: Option<String>,
    pub message: String,
    /// 可抑制的问题只产生警告
    pub suppressible: bool,
}

impl ValidationIssue {
    fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.map(str::to_string),
            message: message.into(),
            suppressible: false,
        }
    }

    fn warning(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            message: message.into(),
            suppressible: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerNode {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorNode {
    pub id: String,
    pub name: String,
    pub executor: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub dispatch: DispatchOption,
    /// 以map-reduce方式分片执行
    #[serde(default)]
    pub sharded: bool,
    pub timeout_ms: Option<u64>,
}

impl ExecutorNode {
    pub fn new(id: impl Into<String>, executor: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            executor: executor.into(),
            params: serde_json::Value::Null,
            dispatch: DispatchOption::default(),
            sharded: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNode {
    Trigger(TriggerNode),
    Executor(ExecutorNode),
}

impl FlowNode {
    pub fn trigger(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::Trigger(TriggerNode {
            name: id.clone(),
            id,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Trigger(node) => &node.id,
            Self::Executor(node) => &node.id,
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger(_))
    }

    pub fn as_executor(&self) -> Option<&ExecutorNode> {
        match self {
            Self::Executor(node) => Some(node),
            Self::Trigger(_) => None,
        }
    }

    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match self {
            Self::Trigger(node) => {
                if node.name.trim().is_empty() {
                    issues.push(ValidationIssue::warning(&node.id, "触发节点名称为空"));
                }
            }
            Self::Executor(node) => {
                if node.executor.trim().is_empty() {
                    issues.push(ValidationIssue::error(Some(node.id.as_str()), "未指定执行器"));
                }
                if node.name.trim().is_empty() {
                    issues.push(ValidationIssue::warning(&node.id, "执行器节点名称为空"));
                }
                if node.timeout_ms == Some(0) {
                    issues.push(ValidationIssue::warning(&node.id, "超时时间为0, 将使用默认值"));
                }
                if node.dispatch.tag_filters.iter().any(|f| f.tag_values.is_empty()) {
                    issues.push(ValidationIssue::warning(&node.id, "标签过滤条件没有取值"));
                }
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// 单个作业: 一个触发节点加一个执行器节点
    pub fn single_job(id: impl Into<String>, job: ExecutorNode) -> Self {
        let id = id.into();
        let job_id = job.id.clone();
        Self::new(id.clone(), id)
            .with_node(FlowNode::trigger("trigger"))
            .with_node(FlowNode::Executor(job))
            .with_edge("trigger", &job_id)
    }

    pub fn with_node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push(FlowEdge {
            from: from.to_string(),
            to: to.to_string(),
        });
        self
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn parents(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn children(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    pub fn executor_nodes(&self) -> impl Iterator<Item = &ExecutorNode> {
        self.nodes.iter().filter_map(FlowNode::as_executor)
    }

    /// 结构校验加上每个节点的自校验
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.nodes.is_empty() {
            issues.push(ValidationIssue::error(None, "工作流没有节点"));
            return issues;
        }
        if self.nodes.len() > MAX_FLOW_NODES {
            issues.push(ValidationIssue::error(
                None,
                format!("节点数 {} 超过上限 {}", self.nodes.len(), MAX_FLOW_NODES),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                issues.push(ValidationIssue::error(Some(node.id()), "节点ID重复"));
            }
            issues.extend(node.validate());
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    issues.push(ValidationIssue::error(Some(end.as_str()), "边引用了不存在的节点"));
                }
            }
            if self.node(&edge.to).is_some_and(FlowNode::is_trigger) {
                issues.push(ValidationIssue::error(
                    Some(edge.to.as_str()),
                    "触发节点不能作为子节点",
                ));
            }
        }

        for node in &self.nodes {
            if !node.is_trigger() && self.parents(node.id()).is_empty() {
                issues.push(ValidationIssue::error(
                    Some(node.id()),
                    "入口节点必须是触发节点",
                ));
            }
        }

        if self.has_cycle() {
            issues.push(ValidationIssue::error(None, "检测到循环依赖"));
        }

        issues
    }

    pub fn ensure_valid(&self) -> SchedulerResult<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|issue| !issue.suppressible)
            .map(|issue| match issue.node_id {
                Some(id) => format!("{id}: {}", issue.message),
                None => issue.message,
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::InvalidFlow(errors.join("; ")))
        }
    }

    /// Kahn拓扑排序, 处理不完的节点说明存在环
    fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id(), 0)).collect();
        for edge in &self.edges {
            if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                *degree += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop_front() {
            processed += 1;
            for child in self.children(node) {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
        processed < in_degree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Flow {
        Flow::new("f1", "diamond")
            .with_node(FlowNode::trigger("t"))
            .with_node(FlowNode::Executor(ExecutorNode::new("a", "shell")))
            .with_node(FlowNode::Executor(ExecutorNode::new("b", "shell")))
            .with_node(FlowNode::Executor(ExecutorNode::new("c", "shell")))
            .with_edge("t", "a")
            .with_edge("t", "b")
            .with_edge("a", "c")
            .with_edge("b", "c")
    }

    #[test]
    fn test_valid_diamond() {
        let flow = diamond();
        assert!(flow.validate().is_empty());
        assert!(flow.ensure_valid().is_ok());
        let mut parents = flow.parents("c");
        parents.sort();
        assert_eq!(parents, vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_detected() {
        let flow = diamond().with_edge("c", "a");
        let issues = flow.validate();
        assert!(issues.iter().any(|i| i.message.contains("循环")));
        assert!(flow.ensure_valid().is_err());
    }

    #[test]
    fn test_entry_must_be_trigger_and_trigger_never_child() {
        let flow = Flow::new("f2", "bad")
            .with_node(FlowNode::trigger("t"))
            .with_node(FlowNode::Executor(ExecutorNode::new("orphan", "shell")))
            .with_node(FlowNode::trigger("t2"))
            .with_edge("t", "t2");
        let issues = flow.validate();
        assert!(issues
            .iter()
            .any(|i| i.node_id.as_deref() == Some("orphan") && !i.suppressible));
        assert!(issues
            .iter()
            .any(|i| i.node_id.as_deref() == Some("t2") && !i.suppressible));
    }

    #[test]
    fn test_node_limit() {
        let mut flow = Flow::new("big", "big").with_node(FlowNode::trigger("t"));
        for i in 0..MAX_FLOW_NODES {
            let id = format!("n{i}");
            flow = flow
                .with_node(FlowNode::Executor(ExecutorNode::new(id.clone(), "shell")))
                .with_edge("t", &id);
        }
        assert!(flow.ensure_valid().is_err());
    }

    #[test]
    fn test_suppressible_issues_do_not_block() {
        let mut job = ExecutorNode::new("job", "shell");
        job.timeout_ms = Some(0);
        let flow = Flow::single_job("j1", job);
        let issues = flow.validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].suppressible);
        assert!(flow.ensure_valid().is_ok());
    }
}
