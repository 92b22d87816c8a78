//! 生成作业输入并排队

use std::collections::BTreeMap;

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::store::load_recipe_instance;
use orchestrator_domain::{Data, JobStatus, RecipeInstance, RecipeTypeRevision};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::blocked_jobs::recipe_metrics_messages;
use super::{CancelJobs, CommandContext, CommandMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessJobInput {
    pub job_ids: Vec<i64>,
}

impl ProcessJobInput {
    /// 只处理 PENDING/BLOCKED 的作业。没有输入的配方作业从配方输入和上游输出生成输入，
    /// 输入无效的作业被取消；从未执行过的作业随后排队。
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = ctx.store.begin().await?;
        let jobs = tx.lock_jobs(&self.job_ids).await?;

        let mut instances: BTreeMap<i64, (RecipeTypeRevision, RecipeInstance)> = BTreeMap::new();
        let mut to_queue = Vec::new();
        let mut invalid = Vec::new();
        let mut recipe_ids = Vec::new();

        for mut job in jobs {
            if !matches!(job.status, JobStatus::Pending | JobStatus::Blocked) {
                debug!(job.id = job.id, job.status = %job.status, "作业状态不需要处理输入");
                continue;
            }
            if !job.has_input() {
                let (Some(recipe_id), Some(node_name)) = (job.recipe_id, job.node_name.clone())
                else {
                    error!(job.id = job.id, "独立作业没有输入，无法生成");
                    continue;
                };
                if !instances.contains_key(&recipe_id) {
                    let recipe = tx
                        .get_recipes(&[recipe_id])
                        .await?
                        .pop()
                        .ok_or(OrchestratorError::RecipeNotFound { id: recipe_id })?;
                    let loaded = load_recipe_instance(tx.as_mut(), recipe).await?;
                    instances.insert(recipe_id, loaded);
                }
                let Some((revision, instance)) = instances.get(&recipe_id) else {
                    continue;
                };
                let recipe_input = instance.recipe.input.clone().unwrap_or_else(Data::new);
                match revision.definition.generate_node_input_data(
                    &node_name,
                    &recipe_input,
                    &instance.node_outputs(),
                ) {
                    Ok(input) => {
                        job.input = Some(input);
                        tx.update_job(&job).await?;
                    }
                    Err(e @ OrchestratorError::InvalidData { .. }) => {
                        warn!(job.id = job.id, error = %e, "作业输入无效，取消作业");
                        invalid.push(job.id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(recipe_id) = job.recipe_id {
                recipe_ids.push(recipe_id);
            }
            if job.num_exes == 0 {
                to_queue.push(job);
            }
        }

        let queued = ctx
            .queue_manager
            .queue_jobs(tx.as_mut(), to_queue, None, when)
            .await?;
        tx.commit().await?;

        debug!(
            requested = self.job_ids.len(),
            queued = queued.len(),
            invalid = invalid.len(),
            "作业输入已处理"
        );
        recipe_ids.sort_unstable();
        recipe_ids.dedup();
        let mut messages = CancelJobs::messages(&invalid, when, ctx.max_num());
        messages.extend(recipe_metrics_messages(recipe_ids, ctx.max_num()));
        Ok(messages)
    }
}
