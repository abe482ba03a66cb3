use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 负载均衡策略选择
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceType {
    Random,
    #[default]
    RoundRobin,
    ResourceAware,
    Appoint,
}

/// 标签匹配语义
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagCondition {
    /// 节点标签至少包含一个要求的值
    #[default]
    Any,
    /// 节点标签包含全部要求的值
    All,
    /// 节点标签不包含任何要求的值
    Exclude,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagFilter {
    pub tag_name: String,
    pub tag_values: Vec<String>,
    #[serde(default)]
    pub condition: TagCondition,
}

impl TagFilter {
    pub fn any(tag_name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            tag_name: tag_name.into(),
            tag_values: values.iter().map(|v| v.to_string()).collect(),
            condition: TagCondition::Any,
        }
    }

    pub fn matches(&self, tags: &HashMap<String, Vec<String>>) -> bool {
        let node_values = tags.get(&self.tag_name).map(Vec::as_slice).unwrap_or(&[]);
        let contains = |v: &String| node_values.contains(v);
        match self.condition {
            TagCondition::Any => self.tag_values.iter().any(contains),
            TagCondition::All => self.tag_values.iter().all(contains),
            TagCondition::Exclude => !self.tag_values.iter().any(contains),
        }
    }
}

/// 派发约束
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOption {
    #[serde(default)]
    pub load_balance_type: LoadBalanceType,
    /// CPU核数要求, <=0 表示不限制
    #[serde(default)]
    pub cpu_requirement: f64,
    /// 内存要求(MB), <=0 表示不限制
    #[serde(default)]
    pub ram_requirement_mb: i64,
    #[serde(default)]
    pub tag_filters: Vec<TagFilter>,
}

impl DispatchOption {
    pub fn with_strategy(load_balance_type: LoadBalanceType) -> Self {
        Self {
            load_balance_type,
            ..Default::default()
        }
    }
}

/// 单次调用参数, 可以指定目标节点
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationParams {
    pub appoint_server_id: Option<String>,
    pub appoint_url: Option<String>,
}

impl InvocationParams {
    pub fn appoint(server_id: impl Into<String>) -> Self {
        Self {
            appoint_server_id: Some(server_id.into()),
            appoint_url: None,
        }
    }

    pub fn is_appointed(&self) -> bool {
        self.appoint_server_id.is_some() || self.appoint_url.is_some()
    }
}
