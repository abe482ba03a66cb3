//! 调度扫描
//!
//! 每个调度资源由选出的唯一broker负责: 先用版本号比较交换认领,
//! 触发前再用一次比较交换推进 last_trigger_at, 保证同一触发点只触发一次。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{
    Execution, FlowRepository, IdGenerator, IdKind, RefType, Schedule, ScheduleDelay,
    ScheduleDelayRepository, ScheduleOption, ScheduleRepository,
};
use jobflow_infrastructure::MetricsCollector;

use crate::calculator::{CalculatorRegistry, CronCalculator};
use crate::execution_manager::{ExecutionManager, TriggerRequest};
use crate::registry::NodeRegistry;

/// 以调度版本为键缓存的下次触发时间, 版本变化即重算
#[derive(Debug, Clone, Copy)]
struct Timer {
    version: u64,
    next: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub fired: usize,
    pub delays_fired: usize,
}

pub struct ScheduleSweeper {
    server_id: String,
    broker_url: String,
    registry: Arc<NodeRegistry>,
    schedules: Arc<dyn ScheduleRepository>,
    delays: Arc<dyn ScheduleDelayRepository>,
    flows: Arc<dyn FlowRepository>,
    ids: Arc<dyn IdGenerator>,
    calculators: CalculatorRegistry,
    manager: Arc<ExecutionManager>,
    timers: Mutex<HashMap<String, Timer>>,
    metrics: MetricsCollector,
}

impl ScheduleSweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: impl Into<String>,
        broker_url: impl Into<String>,
        registry: Arc<NodeRegistry>,
        schedules: Arc<dyn ScheduleRepository>,
        delays: Arc<dyn ScheduleDelayRepository>,
        flows: Arc<dyn FlowRepository>,
        ids: Arc<dyn IdGenerator>,
        manager: Arc<ExecutionManager>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            broker_url: broker_url.into(),
            registry,
            schedules,
            delays,
            flows,
            ids,
            calculators: CalculatorRegistry::new(),
            manager,
            timers: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// 新建调度; 校验cron表达式和引用的工作流
    pub async fn submit(&self, mut schedule: Schedule) -> SchedulerResult<Schedule> {
        if let ScheduleOption::Cron { expression } = &schedule.option {
            CronCalculator::parse(expression)?;
        }
        self.ensure_flow(&schedule.ref_id).await?;
        if schedule.id.is_empty() {
            schedule.id = self.ids.next_id(IdKind::Schedule);
        }
        schedule.broker_url = None;
        schedule.version = 0;
        self.schedules.insert(&schedule).await?;
        info!("新建调度 {} -> {}", schedule.id, schedule.ref_id);
        Ok(schedule)
    }

    /// 一次性延迟触发
    pub async fn submit_delay(
        &self,
        ref_id: &str,
        ref_type: RefType,
        fire_at: i64,
    ) -> SchedulerResult<ScheduleDelay> {
        self.ensure_flow(ref_id).await?;
        let delay = ScheduleDelay {
            id: self.ids.next_id(IdKind::Schedule),
            ref_id: ref_id.to_string(),
            ref_type,
            broker_url: None,
            fire_at,
        };
        self.delays.insert(&delay).await?;
        info!("新建延迟触发 {} -> {} @ {}", delay.id, ref_id, fire_at);
        Ok(delay)
    }

    /// 手动触发, 不影响调度自身的触发进度
    pub async fn trigger_now(&self, schedule_id: &str) -> SchedulerResult<Execution> {
        let schedule = self
            .schedules
            .find_by_id(schedule_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("Schedule", schedule_id))?;
        let mut request = TriggerRequest::manual(&schedule.ref_id, schedule.ref_type);
        request.schedule_id = Some(schedule.id.clone());
        self.manager.trigger(request).await
    }

    pub async fn sweep(&self, now: i64) -> SchedulerResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for schedule in self.schedules.find_enabled().await? {
            match self.sweep_schedule(schedule, now).await {
                Ok(true) => report.fired += 1,
                Ok(false) => {}
                Err(e) => warn!("处理调度失败: {}", e),
            }
        }
        for delay in self.delays.find_all().await? {
            if delay.fire_at > now {
                continue;
            }
            match self.fire_delay(&delay, now).await {
                Ok(true) => report.delays_fired += 1,
                Ok(false) => {}
                Err(e) => warn!("处理延迟触发 {} 失败: {}", delay.id, e),
            }
        }

        self.metrics
            .record_sweep_duration(started.elapsed().as_secs_f64());
        if report.fired + report.delays_fired > 0 {
            debug!("本轮扫描触发 {} 个调度, {} 个延迟任务", report.fired, report.delays_fired);
        }
        Ok(report)
    }

    async fn sweep_schedule(&self, schedule: Schedule, now: i64) -> SchedulerResult<bool> {
        if !self.owns(&schedule.id, now).await {
            self.timers.lock().await.remove(&schedule.id);
            return Ok(false);
        }
        let Some(schedule) = self.claim(schedule).await? else {
            return Ok(false);
        };

        let next = {
            let mut timers = self.timers.lock().await;
            match timers.get(&schedule.id) {
                Some(timer) if timer.version == schedule.version => timer.next,
                _ => {
                    let next = self.calculators.next_trigger(&schedule, now);
                    timers.insert(
                        schedule.id.clone(),
                        Timer {
                            version: schedule.version,
                            next,
                        },
                    );
                    next
                }
            }
        };
        match next {
            Some(next) if next <= now => self.fire(schedule, next).await,
            _ => Ok(false),
        }
    }

    async fn owns(&self, resource_id: &str, now: i64) -> bool {
        match self.registry.elect(resource_id, now).await {
            Some(owner) => owner.server_id == self.server_id,
            None => {
                debug!(
                    "{}",
                    SchedulerError::ElectionUnresolved {
                        resource_id: resource_id.to_string()
                    }
                );
                false
            }
        }
    }

    /// 记录当前broker为调度所有者; 比较交换失败说明有并发修改, 下一轮再处理
    async fn claim(&self, schedule: Schedule) -> SchedulerResult<Option<Schedule>> {
        if schedule.broker_url.as_deref() == Some(self.broker_url.as_str()) {
            return Ok(Some(schedule));
        }
        let mut claimed = schedule.clone();
        claimed.broker_url = Some(self.broker_url.clone());
        claimed.version = schedule.version + 1;
        if self.schedules.update(&claimed, schedule.version).await? {
            info!("broker {} 接管调度 {}", self.server_id, claimed.id);
            Ok(Some(claimed))
        } else {
            debug!("认领调度 {} 时版本冲突", schedule.id);
            Ok(None)
        }
    }

    async fn fire(&self, schedule: Schedule, trigger_at: i64) -> SchedulerResult<bool> {
        let mut advanced = schedule.clone();
        advanced.last_trigger_at = Some(trigger_at);
        advanced.version = schedule.version + 1;
        if !self.schedules.update(&advanced, schedule.version).await? {
            debug!("调度 {} 已被并发推进, 跳过本次触发", schedule.id);
            return Ok(false);
        }
        self.timers.lock().await.remove(&schedule.id);

        let schedule_type = format!("{:?}", schedule.schedule_type());
        self.metrics.record_trigger(&schedule_type);
        let request = TriggerRequest {
            ref_id: schedule.ref_id.clone(),
            ref_type: schedule.ref_type,
            schedule_id: Some(schedule.id.clone()),
            trigger_at,
            invocation: Default::default(),
        };
        self.manager.trigger(request).await?;
        Ok(true)
    }

    /// 删除成功者独占触发权
    async fn fire_delay(&self, delay: &ScheduleDelay, now: i64) -> SchedulerResult<bool> {
        if !self.owns(&delay.id, now).await {
            return Ok(false);
        }
        if !self.delays.delete(&delay.id).await? {
            return Ok(false);
        }
        self.metrics.record_trigger("Delay");
        let request = TriggerRequest {
            ref_id: delay.ref_id.clone(),
            ref_type: delay.ref_type,
            schedule_id: None,
            trigger_at: delay.fire_at,
            invocation: Default::default(),
        };
        self.manager.trigger(request).await?;
        Ok(true)
    }

    async fn ensure_flow(&self, ref_id: &str) -> SchedulerResult<()> {
        match self.flows.find_by_id(ref_id).await? {
            Some(flow) => flow.ensure_valid(),
            None => Err(SchedulerError::not_found("Flow", ref_id)),
        }
    }
}
