use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use jobflow_broker::{Broker, BrokerStores};
use jobflow_core::AppConfig;
use jobflow_worker::WorkerService;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Broker,
    Worker,
    /// 同一进程内运行broker和worker
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "broker" => Ok(Self::Broker),
            "worker" => Ok(Self::Worker),
            "all" => Ok(Self::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }

    fn runs_broker(&self) -> bool {
        matches!(self, Self::Broker | Self::All)
    }

    fn runs_worker(&self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

pub struct Application {
    mode: AppMode,
    broker: Option<Arc<Broker>>,
    worker: Option<Arc<WorkerService>>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序, 模式: {:?}", mode);
        let broker = if mode.runs_broker() {
            Some(Arc::new(
                Broker::builder(config.broker.clone())
                    .stores(BrokerStores::in_memory())
                    .build()
                    .context("创建broker失败")?,
            ))
        } else {
            None
        };
        let worker = if mode.runs_worker() {
            Some(Arc::new(
                WorkerService::builder(config.worker.clone())
                    .build()
                    .context("创建worker失败")?,
            ))
        } else {
            None
        };
        Ok(Self {
            mode,
            broker,
            worker,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行所有组件直到收到关闭信号; 任一组件失败时返回错误
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut handles = Vec::new();

        if let Some(broker) = &self.broker {
            let broker = broker.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push((
                "broker",
                tokio::spawn(async move { broker.run(shutdown_rx).await }),
            ));
        }
        if let Some(worker) = &self.worker {
            let worker = worker.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push((
                "worker",
                tokio::spawn(async move { worker.run(shutdown_rx).await }),
            ));
        }

        let mut failed = None;
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => info!("{} 已退出", name),
                Ok(Err(e)) => {
                    error!("{} 运行失败: {}", name, e);
                    failed.get_or_insert_with(|| anyhow::anyhow!("{name} 运行失败: {e}"));
                }
                Err(e) => {
                    error!("{} 任务异常退出: {}", name, e);
                    failed.get_or_insert_with(|| anyhow::anyhow!("{name} 任务异常退出: {e}"));
                }
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(AppMode::parse("broker").unwrap(), AppMode::Broker);
        assert_eq!(AppMode::parse("all").unwrap(), AppMode::All);
        assert!(AppMode::parse("dispatcher").is_err());
        assert!(AppMode::All.runs_broker() && AppMode::All.runs_worker());
        assert!(!AppMode::Worker.runs_broker());
    }

    #[test]
    fn test_application_builds_requested_components() {
        let app = Application::new(AppConfig::default(), AppMode::Broker).unwrap();
        assert!(app.broker.is_some());
        assert!(app.worker.is_none());

        let app = Application::new(AppConfig::default(), AppMode::All).unwrap();
        assert!(app.broker.is_some() && app.worker.is_some());
    }
}
