//! 编排器配置
//!
//! 所有配置段都是带默认值的强类型结构：缺失字段由 `Default` 补齐，
//! 加载后统一经过 `validate()` 校验边界。
//!
//! 加载顺序：
//! 1. 内置默认值
//! 2. TOML 配置文件
//! 3. `ORCHESTRATOR_` 前缀的环境变量（嵌套字段以 `__` 分隔）

pub mod models;

pub use models::{
    AppConfig, ClusterAgentConfig, ClusterConfig, MessageQueueConfig, ObservabilityConfig,
    PipelineConfig, SchedulerConfig, TaskTimeoutConfig,
};
