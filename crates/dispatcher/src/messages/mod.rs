//! 命令消息
//!
//! 每种消息一个模块。消息在提交事务之后才被发布，执行时返回需要继续发布的后续消息；
//! 所有消息都先查找已经创建的行，重复投递不会重复创建。

pub mod blocked_jobs;
pub mod cancel_jobs;
pub mod create_batch_recipes;
pub mod create_jobs;
pub mod create_recipes;
pub mod pending_jobs;
pub mod process_job_input;
pub mod process_recipe_input;
pub mod supersede_recipe_nodes;
pub mod unpublish_jobs;
pub mod update_batch_metrics;
pub mod update_recipe;
pub mod update_recipe_metrics;

use std::sync::Arc;

use orchestrator_core::{Message, OrchestratorError, OrchestratorResult, PipelineConfig};
use orchestrator_domain::Store;
use orchestrator_infrastructure::MetricsCollector;
use serde::{Deserialize, Serialize};

use crate::queue_manager::QueueManager;

pub use blocked_jobs::BlockedJobs;
pub use cancel_jobs::CancelJobs;
pub use create_batch_recipes::CreateBatchRecipes;
pub use create_jobs::{CreateJobs, RecipeJob};
pub use create_recipes::{CreateRecipes, CreateRecipesKind, SubRecipe};
pub use pending_jobs::PendingJobs;
pub use process_job_input::ProcessJobInput;
pub use process_recipe_input::ProcessRecipeInput;
pub use supersede_recipe_nodes::SupersedeRecipeNodes;
pub use unpublish_jobs::UnpublishJobs;
pub use update_batch_metrics::UpdateBatchMetrics;
pub use update_recipe::UpdateRecipe;
pub use update_recipe_metrics::UpdateRecipeMetrics;

/// 消息执行所需的共享依赖
#[derive(Clone)]
pub struct CommandContext {
    pub store: Arc<dyn Store>,
    pub queue_manager: Arc<QueueManager>,
    pub pipeline: PipelineConfig,
    pub metrics: MetricsCollector,
}

impl CommandContext {
    pub fn new(
        store: Arc<dyn Store>,
        queue_manager: Arc<QueueManager>,
        pipeline: PipelineConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            queue_manager,
            pipeline,
            metrics,
        }
    }

    /// 每条消息携带的最大 ID 数
    pub fn max_num(&self) -> usize {
        self.pipeline.max_num.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandMessage {
    CreateRecipes(CreateRecipes),
    CreateBatchRecipes(CreateBatchRecipes),
    SupersedeRecipeNodes(SupersedeRecipeNodes),
    UpdateRecipe(UpdateRecipe),
    CreateJobs(CreateJobs),
    ProcessJobInput(ProcessJobInput),
    ProcessRecipeInput(ProcessRecipeInput),
    BlockedJobs(BlockedJobs),
    PendingJobs(PendingJobs),
    CancelJobs(CancelJobs),
    UnpublishJobs(UnpublishJobs),
    UpdateRecipeMetrics(UpdateRecipeMetrics),
    UpdateBatchMetrics(UpdateBatchMetrics),
}

impl CommandMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            CommandMessage::CreateRecipes(_) => "create_recipes",
            CommandMessage::CreateBatchRecipes(_) => "create_batch_recipes",
            CommandMessage::SupersedeRecipeNodes(_) => "supersede_recipe_nodes",
            CommandMessage::UpdateRecipe(_) => "update_recipe",
            CommandMessage::CreateJobs(_) => "create_jobs",
            CommandMessage::ProcessJobInput(_) => "process_job_input",
            CommandMessage::ProcessRecipeInput(_) => "process_recipe_input",
            CommandMessage::BlockedJobs(_) => "blocked_jobs",
            CommandMessage::PendingJobs(_) => "pending_jobs",
            CommandMessage::CancelJobs(_) => "cancel_jobs",
            CommandMessage::UnpublishJobs(_) => "unpublish_jobs",
            CommandMessage::UpdateRecipeMetrics(_) => "update_recipe_metrics",
            CommandMessage::UpdateBatchMetrics(_) => "update_batch_metrics",
        }
    }

    pub fn to_json(&self) -> OrchestratorResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> OrchestratorResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// 包装成队列消息
    pub fn to_message(&self) -> OrchestratorResult<Message> {
        Ok(Message::command(self.message_type(), self.to_json()?))
    }

    pub fn from_message(message: &Message) -> OrchestratorResult<Self> {
        let command = Self::from_json(message.payload.clone())?;
        if command.message_type() != message.message_type {
            return Err(OrchestratorError::invalid_data(
                "MESSAGE_TYPE_MISMATCH",
                format!(
                    "Message type '{}' does not match payload '{}'",
                    message.message_type,
                    command.message_type()
                ),
            ));
        }
        Ok(command)
    }

    /// 执行消息，返回需要继续发布的消息
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        match self {
            CommandMessage::CreateRecipes(message) => message.execute(ctx).await,
            CommandMessage::CreateBatchRecipes(message) => message.execute(ctx).await,
            CommandMessage::SupersedeRecipeNodes(message) => message.execute(ctx).await,
            CommandMessage::UpdateRecipe(message) => message.execute(ctx).await,
            CommandMessage::CreateJobs(message) => message.execute(ctx).await,
            CommandMessage::ProcessJobInput(message) => message.execute(ctx).await,
            CommandMessage::ProcessRecipeInput(message) => message.execute(ctx).await,
            CommandMessage::BlockedJobs(message) => message.execute(ctx).await,
            CommandMessage::PendingJobs(message) => message.execute(ctx).await,
            CommandMessage::CancelJobs(message) => message.execute(ctx).await,
            CommandMessage::UnpublishJobs(message) => message.execute(ctx).await,
            CommandMessage::UpdateRecipeMetrics(message) => message.execute(ctx).await,
            CommandMessage::UpdateBatchMetrics(message) => message.execute(ctx).await,
        }
    }
}

/// 按 `max_num` 切分 ID 列表，每段生成一条消息
pub(crate) fn chunked<T>(
    ids: &[i64],
    max_num: usize,
    build: impl Fn(Vec<i64>) -> T,
) -> Vec<T> {
    ids.chunks(max_num.max(1))
        .map(|chunk| build(chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_chunked_respects_max_num() {
        let ids: Vec<i64> = (1..=250).collect();
        let messages = chunked(&ids, 100, |job_ids| BlockedJobs {
            job_ids,
            when: Utc::now(),
        });
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].job_ids.len(), 100);
        assert_eq!(messages[2].job_ids.len(), 50);
    }

    #[test]
    fn test_message_envelope_round_trip() {
        let command = CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
            recipe_ids: vec![1, 2, 3],
        });
        let message = command.to_message().unwrap();
        assert_eq!(message.message_type, "update_recipe_metrics");
        assert_eq!(message.payload["type"], "update_recipe_metrics");

        let decoded = CommandMessage::from_message(&message).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_mismatched_envelope_is_rejected() {
        let command = CommandMessage::UpdateBatchMetrics(UpdateBatchMetrics { batch_ids: vec![7] });
        let mut message = command.to_message().unwrap();
        message.message_type = "update_recipe".to_string();

        let err = CommandMessage::from_message(&message).unwrap_err();
        assert!(err.is_fatal());
    }
}
