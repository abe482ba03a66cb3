use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution与Task共用的状态
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    #[default]
    Created,
    Queued,
    Running,
    Paused,
    Restarted,
    Killing,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// KILLING期间任务仍可能在worker上运行
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Killing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Restarted => "RESTARTED",
            Self::Killing => "KILLING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    Enqueue,
    Start,
    Succeed,
    Fail,
    Kill,
    Cancel,
    Pause,
    Restart,
    /// 派发或执行中失联, 等待重新派发
    Lose,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

use ExecutionState::*;
use StateEvent::*;

const TRANSITIONS: &[(ExecutionState, StateEvent, ExecutionState)] = &[
    (Created, Enqueue, Queued),
    (Created, Kill, Cancelled),
    (Created, Fail, Failed),
    (Restarted, Enqueue, Queued),
    (Restarted, Kill, Killing),
    (Restarted, Fail, Failed),
    (Queued, Start, Running),
    (Queued, Succeed, Success),
    (Queued, Fail, Failed),
    (Queued, Kill, Killing),
    (Queued, Lose, Restarted),
    (Running, Succeed, Success),
    (Running, Fail, Failed),
    (Running, Kill, Killing),
    (Running, Pause, Paused),
    (Running, Lose, Restarted),
    (Paused, Restart, Restarted),
    (Paused, Kill, Killing),
    (Killing, Cancel, Cancelled),
    (Killing, Succeed, Success),
    (Killing, Fail, Failed),
];

/// 状态变更结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: ExecutionState,
        to: ExecutionState,
    },
    /// 终态实体上的任何变更都是空操作
    Ignored,
    /// 当前状态不接受该事件
    Rejected,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

pub fn next_state(state: ExecutionState, event: StateEvent) -> Option<ExecutionState> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
}

pub fn transition(state: ExecutionState, event: StateEvent) -> Transition {
    if state.is_terminal() {
        return Transition::Ignored;
    }
    match next_state(state, event) {
        Some(to) => Transition::Applied { from: state, to },
        None => Transition::Rejected,
    }
}
