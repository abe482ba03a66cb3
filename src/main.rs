use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobflow::{wait_for_signal, AppMode, Application, ShutdownManager};
use jobflow_core::{AppConfig, MetricsConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobflow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式作业与工作流调度平台")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径, 缺省时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["broker", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别, 覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式, 覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.logging.level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.logging.format);
    init_logging(log_level, log_format)?;
    init_metrics(&config.metrics)?;

    let mode = match matches.get_one::<String>("mode") {
        Some(mode) => AppMode::parse(mode)?,
        None => AppMode::All,
    };
    info!("启动jobflow, 模式: {:?}", mode);

    let app = Arc::new(Application::new(config, mode)?);
    let shutdown = ShutdownManager::new();

    let mut app_handle = {
        let app = app.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            info!("开始优雅关闭...");
            shutdown.shutdown();
        }
        finished = &mut app_handle => {
            // 组件在收到信号前退出, 通常是启动失败
            return match finished {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {}", e),
        Ok(Err(e)) => error!("应用任务异常退出: {}", e),
        Err(_) => warn!("应用关闭超时, 强制退出"),
    }
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        other => return Err(anyhow::anyhow!("不支持的日志格式: {other}")),
    }
    Ok(())
}

fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("指标监听地址无效: {}", config.bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus导出器失败")?;
    info!("Prometheus指标暴露于 {}", addr);
    Ok(())
}
