//! 编排核心
//!
//! 命令消息管道（配方展开、取代、传播）、作业队列、批次创建以及资源供给调度循环。

pub mod batch_service;
pub mod messages;
pub mod processor;
pub mod queue_manager;
pub mod scheduler;

pub use batch_service::BatchService;
pub use messages::{CommandContext, CommandMessage};
pub use processor::{CommandPublisher, MessageProcessor};
pub use queue_manager::{ExecutionAssignment, QueueManager, ScheduledExecution};
pub use scheduler::{OfferRound, ScaleOffer, ScaleScheduler, SchedulerContext};
