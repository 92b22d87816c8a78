//! Observability module
//!
//! 指标采集与结构化日志。日志订阅器的初始化在 `orchestrator_core::logging`。

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
