use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefType {
    Job,
    Workflow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    FixedRate,
    Cron,
    Delay,
}

/// 调度配置, 时间均为毫秒时间戳
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleOption {
    #[serde(rename_all = "camelCase")]
    FixedRate {
        start_at: i64,
        interval_ms: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Cron { expression: String },
    #[serde(rename_all = "camelCase")]
    Delay { fire_at: i64 },
}

impl ScheduleOption {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Self::FixedRate { .. } => ScheduleType::FixedRate,
            Self::Cron { .. } => ScheduleType::Cron,
            Self::Delay { .. } => ScheduleType::Delay,
        }
    }
}

/// 周期性触发器
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub ref_id: String,
    pub ref_type: RefType,
    pub option: ScheduleOption,
    /// 当前持有该调度的broker
    pub broker_url: Option<String>,
    pub last_trigger_at: Option<i64>,
    pub last_feedback_at: Option<i64>,
    pub enabled: bool,
    pub version: u64,
}

impl Schedule {
    pub fn new(
        id: impl Into<String>,
        ref_id: impl Into<String>,
        ref_type: RefType,
        option: ScheduleOption,
    ) -> Self {
        Self {
            id: id.into(),
            ref_id: ref_id.into(),
            ref_type,
            option,
            broker_url: None,
            last_trigger_at: None,
            last_feedback_at: None,
            enabled: true,
            version: 0,
        }
    }

    pub fn schedule_type(&self) -> ScheduleType {
        self.option.schedule_type()
    }
}

/// 一次性延迟触发
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDelay {
    pub id: String,
    pub ref_id: String,
    pub ref_type: RefType,
    pub broker_url: Option<String>,
    pub fire_at: i64,
}
