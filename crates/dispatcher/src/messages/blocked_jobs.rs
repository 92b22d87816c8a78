//! PENDING -> BLOCKED

use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::JobStatus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommandContext, CommandMessage, UpdateRecipeMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedJobs {
    pub job_ids: Vec<i64>,
    pub when: DateTime<Utc>,
}

impl BlockedJobs {
    pub fn messages(job_ids: &[i64], when: DateTime<Utc>, max_num: usize) -> Vec<CommandMessage> {
        super::chunked(job_ids, max_num, |job_ids| {
            CommandMessage::BlockedJobs(BlockedJobs { job_ids, when })
        })
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let recipe_ids =
            update_job_status(ctx, &self.job_ids, JobStatus::Pending, JobStatus::Blocked, self.when)
                .await?;
        Ok(recipe_metrics_messages(recipe_ids, ctx.max_num()))
    }
}

/// 只转换处于 `from` 状态的作业，返回受影响的配方 ID
pub(crate) async fn update_job_status(
    ctx: &CommandContext,
    job_ids: &[i64],
    from: JobStatus,
    to: JobStatus,
    when: DateTime<Utc>,
) -> OrchestratorResult<Vec<i64>> {
    let mut tx = ctx.store.begin().await?;
    let mut recipe_ids = Vec::new();
    let mut updated = 0usize;
    for mut job in tx.lock_jobs(job_ids).await? {
        if job.status != from {
            continue;
        }
        job.set_status(to, when);
        tx.update_job(&job).await?;
        updated += 1;
        if let Some(recipe_id) = job.recipe_id {
            recipe_ids.push(recipe_id);
        }
    }
    tx.commit().await?;

    recipe_ids.sort_unstable();
    recipe_ids.dedup();
    debug!(from = %from, to = %to, requested = job_ids.len(), updated, "作业状态已更新");
    Ok(recipe_ids)
}

pub(crate) fn recipe_metrics_messages(recipe_ids: Vec<i64>, max_num: usize) -> Vec<CommandMessage> {
    super::chunked(&recipe_ids, max_num, |recipe_ids| {
        CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics { recipe_ids })
    })
}
