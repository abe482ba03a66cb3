use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::errors::{SchedulerError, SchedulerResult};

/// 服务生命周期状态, 只能单向推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Initializing = 1,
    Running = 2,
    Terminating = 3,
    Terminated = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct ServerLifecycle {
    state: AtomicU8,
}

impl ServerLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 推进到目标状态; 目标不晚于当前状态时返回false
    pub fn advance(&self, target: ServerState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if target as u8 <= current {
                return false;
            }
            match self.state.compare_exchange(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(
                        "服务状态变更: {} -> {}",
                        ServerState::from_u8(current),
                        target
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// 非RUNNING状态下的请求快速失败
    pub fn ensure_running(&self) -> SchedulerResult<()> {
        let state = self.state();
        if state == ServerState::Running {
            Ok(())
        } else {
            Err(SchedulerError::ServerNotReady {
                state: state.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_is_monotonic() {
        let lifecycle = ServerLifecycle::new();
        assert_eq!(lifecycle.state(), ServerState::Idle);
        assert!(lifecycle.ensure_running().is_err());

        assert!(lifecycle.advance(ServerState::Initializing));
        assert!(lifecycle.advance(ServerState::Running));
        assert!(lifecycle.ensure_running().is_ok());

        assert!(!lifecycle.advance(ServerState::Initializing));
        assert_eq!(lifecycle.state(), ServerState::Running);

        assert!(lifecycle.advance(ServerState::Terminated));
        assert!(!lifecycle.advance(ServerState::Terminating));
        match lifecycle.ensure_running() {
            Err(SchedulerError::ServerNotReady { state }) => assert_eq!(state, "TERMINATED"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
