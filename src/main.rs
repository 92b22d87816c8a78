use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use orchestrator_core::{init_logging, AppConfig, ObservabilityConfig};
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::Application;
use shutdown::{wait_for_shutdown_signal, ShutdownManager};

/// 集群作业编排系统
#[derive(Debug, Parser)]
#[command(name = "orchestrator", version, about = "集群作业编排系统")]
struct Args {
    /// 配置文件路径，未指定时依次查找默认位置，都不存在则使用内置默认值
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 覆盖配置中的日志级别
    #[arg(short, long, value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 覆盖配置中的日志格式
    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty", "compact"])]
    log_format: Option<String>,

    /// 启动时暂停调度，只推进已在运行的执行
    #[arg(long)]
    paused: bool,

    /// 启动后创建一个演示批次，数据集包含指定数量的文件
    #[arg(long, value_name = "N")]
    demo_files: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认>")))?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.observability.log_format = format;
    }
    if args.paused {
        config.scheduler.paused = true;
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    info!(config = config_path.unwrap_or("<默认>"), "启动集群作业编排系统");

    // recorder 必须在创建 MetricsCollector 之前安装
    if config.observability.metrics_enabled {
        init_metrics(&config.observability)?;
    }

    let app = Application::new(config).await?;
    if let Some(files) = args.demo_files {
        app.seed_demo_batch(files).await.context("创建演示批次失败")?;
    }

    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe().await;
    let app_handle = tokio::spawn(app.run(shutdown_rx));

    let signal = wait_for_shutdown_signal().await;
    info!(signal, "收到关闭信号，停止消息处理器与调度器");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("集群作业编排系统已退出");
    Ok(())
}

/// 安装 Prometheus recorder 并启动 HTTP 监听
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let address: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("指标监听地址无效: {}", config.metrics_bind_address))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {e}"))?;
    info!(address = %address, "Prometheus exporter initialized");
    Ok(())
}
