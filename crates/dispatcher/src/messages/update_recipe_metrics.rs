//! 重新计算配方计数

use std::collections::BTreeSet;

use chrono::Utc;
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{JobStatus, RecipeCounts};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommandContext, CommandMessage, UpdateBatchMetrics, UpdateRecipe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecipeMetrics {
    pub recipe_ids: Vec<i64>,
}

impl UpdateRecipeMetrics {
    /// 计数来自配方自身的节点；父配方继续更新计数并推进，顶层配方更新所属批次
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = ctx.store.begin().await?;
        let mut parent_ids = BTreeSet::new();
        let mut batch_ids = BTreeSet::new();

        for mut recipe in tx.lock_recipes(&self.recipe_ids).await? {
            let nodes = tx.get_recipe_nodes(recipe.id).await?;
            let job_ids: Vec<i64> = nodes.iter().filter_map(|node| node.job_id).collect();
            let sub_recipe_ids: Vec<i64> =
                nodes.iter().filter_map(|node| node.sub_recipe_id).collect();

            let mut counts = RecipeCounts::default();
            for job in tx.get_jobs(&job_ids).await? {
                counts.jobs_total += 1;
                match job.status {
                    JobStatus::Pending => counts.jobs_pending += 1,
                    JobStatus::Blocked => counts.jobs_blocked += 1,
                    JobStatus::Queued => counts.jobs_queued += 1,
                    JobStatus::Running => counts.jobs_running += 1,
                    JobStatus::Failed => counts.jobs_failed += 1,
                    JobStatus::Completed => counts.jobs_completed += 1,
                    JobStatus::Canceled => counts.jobs_canceled += 1,
                }
            }
            for sub_recipe in tx.get_recipes(&sub_recipe_ids).await? {
                counts.sub_recipes_total += 1;
                if sub_recipe.is_completed {
                    counts.sub_recipes_completed += 1;
                }
            }

            if recipe.counts != counts {
                recipe.counts = counts;
                recipe.updated_at = when;
                tx.update_recipe(&recipe).await?;
            }
            match (recipe.recipe_id, recipe.batch_id) {
                (Some(parent_id), _) => {
                    parent_ids.insert(parent_id);
                }
                (None, Some(batch_id)) => {
                    batch_ids.insert(batch_id);
                }
                (None, None) => {}
            }
        }

        let parent_ids: Vec<i64> = parent_ids.into_iter().collect();
        let parents = tx.get_recipes(&parent_ids).await?;
        tx.commit().await?;

        debug!(
            recipes = self.recipe_ids.len(),
            parents = parent_ids.len(),
            "配方计数已更新"
        );
        let max_num = ctx.max_num();
        let mut messages = super::chunked(&parent_ids, max_num, |recipe_ids| {
            CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics { recipe_ids })
        });
        messages.extend(parents.iter().map(|parent| {
            CommandMessage::UpdateRecipe(UpdateRecipe::new(parent.root_superseded_recipe_id, None))
        }));
        let batch_ids: Vec<i64> = batch_ids.into_iter().collect();
        messages.extend(super::chunked(&batch_ids, max_num, |batch_ids| {
            CommandMessage::UpdateBatchMetrics(UpdateBatchMetrics { batch_ids })
        }));
        Ok(messages)
    }
}
