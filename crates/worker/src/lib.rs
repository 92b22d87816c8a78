//! 作业执行的任务状态机

pub mod execution;
pub mod task;

pub use execution::{ExecutionOutcome, ExecutionStatus, RunningJobExecution};
pub use task::{ExecutionTask, TaskKind};
