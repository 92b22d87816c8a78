//! 日志初始化

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 支持的日志格式
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// 初始化全局 tracing 订阅者
///
/// `RUST_LOG` 存在时优先于配置中的日志级别。JSON 格式把事件字段平铺到顶层，
/// `recipe.id`、`job_exe.id` 等字段可以直接检索。
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("无效的日志级别: {log_level}"))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let initialized = match log_format {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        other => bail!("不支持的日志格式: {other}，支持的格式: {LOG_FORMATS:?}"),
    };
    initialized.with_context(|| format!("初始化{log_format}日志格式失败"))
}
