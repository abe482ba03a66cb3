//! 下次触发时间计算
//!
//! 每种调度类型一个计算器, 输入只有调度配置、上次触发时间和当前时间,
//! 返回值永远不早于当前时间。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tracing::{debug, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{Schedule, ScheduleOption, ScheduleType};

pub trait ScheduleCalculator: Send + Sync {
    fn schedule_type(&self) -> ScheduleType;

    /// `Ok(None)` 表示不再触发
    fn calculate(&self, schedule: &Schedule, now: i64) -> SchedulerResult<Option<i64>>;
}

/// 固定频率: 迟到时立即补触发一次, 不回放错过的周期
pub struct FixedRateCalculator;

impl ScheduleCalculator for FixedRateCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::FixedRate
    }

    fn calculate(&self, schedule: &Schedule, now: i64) -> SchedulerResult<Option<i64>> {
        let ScheduleOption::FixedRate {
            start_at,
            interval_ms,
        } = &schedule.option
        else {
            return Err(mismatch(schedule, self.schedule_type()));
        };
        let interval = match interval_ms {
            Some(interval) if *interval > 0 => *interval,
            _ => {
                debug!("调度 {} 未配置有效的间隔", schedule.id);
                return Ok(None);
            }
        };
        let next = match schedule.last_trigger_at {
            None => *start_at,
            Some(last) => last.saturating_add(interval),
        };
        Ok(Some(next.max(now)))
    }
}

pub struct CronCalculator;

impl CronCalculator {
    pub fn parse(expression: &str) -> SchedulerResult<CronSchedule> {
        CronSchedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
            expr: expression.to_string(),
            message: e.to_string(),
        })
    }
}

impl ScheduleCalculator for CronCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::Cron
    }

    fn calculate(&self, schedule: &Schedule, now: i64) -> SchedulerResult<Option<i64>> {
        let ScheduleOption::Cron { expression } = &schedule.option else {
            return Err(mismatch(schedule, self.schedule_type()));
        };
        let cron = Self::parse(expression)?;
        let from = to_datetime(schedule.last_trigger_at.unwrap_or(now))?;
        Ok(cron
            .after(&from)
            .next()
            .map(|next| next.timestamp_millis().max(now)))
    }
}

/// 一次性延迟, 触发过之后不再计算
pub struct DelayCalculator;

impl ScheduleCalculator for DelayCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::Delay
    }

    fn calculate(&self, schedule: &Schedule, now: i64) -> SchedulerResult<Option<i64>> {
        let ScheduleOption::Delay { fire_at } = &schedule.option else {
            return Err(mismatch(schedule, self.schedule_type()));
        };
        if schedule.last_trigger_at.is_some() {
            return Ok(None);
        }
        Ok(Some((*fire_at).max(now)))
    }
}

fn mismatch(schedule: &Schedule, expected: ScheduleType) -> SchedulerError {
    SchedulerError::ScheduleCalculation(format!(
        "调度 {} 的类型 {:?} 与计算器 {:?} 不匹配",
        schedule.id,
        schedule.schedule_type(),
        expected
    ))
}

fn to_datetime(millis: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| SchedulerError::ScheduleCalculation(format!("时间戳越界: {millis}")))
}

/// 按调度类型选择计算器
pub struct CalculatorRegistry {
    calculators: HashMap<ScheduleType, Arc<dyn ScheduleCalculator>>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            calculators: HashMap::new(),
        };
        registry.register(Arc::new(FixedRateCalculator));
        registry.register(Arc::new(CronCalculator));
        registry.register(Arc::new(DelayCalculator));
        registry
    }

    pub fn register(&mut self, calculator: Arc<dyn ScheduleCalculator>) {
        self.calculators
            .insert(calculator.schedule_type(), calculator);
    }

    /// 计算错误只记录日志, 按不触发处理
    pub fn next_trigger(&self, schedule: &Schedule, now: i64) -> Option<i64> {
        if !schedule.enabled {
            return None;
        }
        let calculator = match self.calculators.get(&schedule.schedule_type()) {
            Some(calculator) => calculator,
            None => {
                warn!("没有为调度类型 {:?} 注册计算器", schedule.schedule_type());
                return None;
            }
        };
        match calculator.calculate(schedule, now) {
            Ok(next) => next,
            Err(e) => {
                warn!("调度 {} 计算下次触发时间失败: {}", schedule.id, e);
                None
            }
        }
    }
}

impl Default for CalculatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_domain::RefType;

    const T: i64 = 1_700_000_000_000;

    fn fixed_rate(start_at: i64, interval_ms: Option<i64>, last: Option<i64>) -> Schedule {
        let mut schedule = Schedule::new(
            "s1",
            "job-1",
            RefType::Job,
            ScheduleOption::FixedRate {
                start_at,
                interval_ms,
            },
        );
        schedule.last_trigger_at = last;
        schedule
    }

    #[test]
    fn test_fixed_rate_next_tick() {
        let registry = CalculatorRegistry::new();
        let schedule = fixed_rate(T - 1_000_000, Some(60_000), Some(T));
        assert_eq!(registry.next_trigger(&schedule, T + 10_000), Some(T + 60_000));
    }

    #[test]
    fn test_fixed_rate_first_trigger_late_start() {
        let registry = CalculatorRegistry::new();
        let schedule = fixed_rate(T - 100_000, Some(60_000), None);
        assert_eq!(registry.next_trigger(&schedule, T), Some(T));
    }

    #[test]
    fn test_fixed_rate_first_trigger_future_start() {
        let registry = CalculatorRegistry::new();
        let schedule = fixed_rate(T + 5_000, Some(60_000), None);
        assert_eq!(registry.next_trigger(&schedule, T), Some(T + 5_000));
    }

    #[test]
    fn test_fixed_rate_catch_up_fires_once() {
        let registry = CalculatorRegistry::new();
        // 错过了很多个周期, 只在当前时间补触发一次
        let schedule = fixed_rate(0, Some(60_000), Some(T - 3_600_000));
        assert_eq!(registry.next_trigger(&schedule, T), Some(T));
    }

    #[test]
    fn test_fixed_rate_without_interval_never_triggers() {
        let registry = CalculatorRegistry::new();
        assert_eq!(registry.next_trigger(&fixed_rate(T, None, None), T), None);
        assert_eq!(registry.next_trigger(&fixed_rate(T, Some(0), None), T), None);
    }

    #[test]
    fn test_disabled_schedule_never_triggers() {
        let registry = CalculatorRegistry::new();
        let mut schedule = fixed_rate(T, Some(1000), None);
        schedule.enabled = false;
        assert_eq!(registry.next_trigger(&schedule, T), None);
    }

    #[test]
    fn test_calculation_is_idempotent_and_not_before_now() {
        let registry = CalculatorRegistry::new();
        let schedule = fixed_rate(T - 500, Some(1000), Some(T - 2500));
        let first = registry.next_trigger(&schedule, T);
        let second = registry.next_trigger(&schedule, T);
        assert_eq!(first, second);
        assert!(first.unwrap() >= T);
    }

    #[test]
    fn test_cron_next_minute() {
        let registry = CalculatorRegistry::new();
        let schedule = Schedule::new(
            "c1",
            "job-1",
            RefType::Job,
            ScheduleOption::Cron {
                expression: "0 * * * * *".to_string(),
            },
        );
        // 2023-11-14T22:13:20Z
        let next = registry.next_trigger(&schedule, T).unwrap();
        assert!(next > T);
        assert_eq!(next % 60_000, 0);
        assert!(next - T <= 60_000);
    }

    #[test]
    fn test_invalid_cron_is_logged_not_triggered() {
        let registry = CalculatorRegistry::new();
        let schedule = Schedule::new(
            "c2",
            "job-1",
            RefType::Job,
            ScheduleOption::Cron {
                expression: "not a cron".to_string(),
            },
        );
        assert_eq!(registry.next_trigger(&schedule, T), None);
    }

    #[test]
    fn test_delay_fires_once() {
        let registry = CalculatorRegistry::new();
        let mut schedule = Schedule::new(
            "d1",
            "job-1",
            RefType::Job,
            ScheduleOption::Delay { fire_at: T + 500 },
        );
        assert_eq!(registry.next_trigger(&schedule, T), Some(T + 500));
        schedule.last_trigger_at = Some(T + 500);
        assert_eq!(registry.next_trigger(&schedule, T + 1000), None);
    }
}
