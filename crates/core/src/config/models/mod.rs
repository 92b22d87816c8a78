pub mod app_config;
pub mod cluster;
pub mod message_queue;
pub mod observability;
pub mod pipeline_scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use cluster::{ClusterAgentConfig, ClusterConfig};
pub use message_queue::MessageQueueConfig;
pub use observability::ObservabilityConfig;
pub use pipeline_scheduler::{PipelineConfig, SchedulerConfig, TaskTimeoutConfig};
