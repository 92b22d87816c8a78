//! 重新计算批次计数与按节点名分组的指标

use chrono::Utc;
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{BatchCounts, BatchMetrics};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CommandContext, CommandMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatchMetrics {
    pub batch_ids: Vec<i64>,
}

impl UpdateBatchMetrics {
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = ctx.store.begin().await?;
        for batch_id in &self.batch_ids {
            let Some(mut batch) = tx.lock_batch(*batch_id).await? else {
                warn!(batch.id = batch_id, "批次不存在");
                continue;
            };
            let (recipes_total, recipes_completed) = tx.count_batch_recipes(batch.id).await?;
            let statistics = tx.get_batch_job_statistics(batch.id).await?;

            let mut counts = BatchCounts {
                recipes_total: recipes_total as i32,
                recipes_completed: recipes_completed as i32,
                ..BatchCounts::default()
            };
            for stats in &statistics {
                counts.jobs_total += stats.total;
                counts.jobs_pending += stats.pending;
                counts.jobs_blocked += stats.blocked;
                counts.jobs_queued += stats.queued;
                counts.jobs_running += stats.running;
                counts.jobs_failed += stats.failed;
                counts.jobs_completed += stats.completed;
                counts.jobs_canceled += stats.canceled;
            }
            let metrics: Vec<BatchMetrics> = statistics
                .iter()
                .map(|stats| BatchMetrics::from_statistics(batch.id, stats))
                .collect();
            tx.save_batch_metrics(batch.id, metrics).await?;

            batch.counts = counts;
            batch.updated_at = when;
            tx.update_batch(&batch).await?;
            debug!(
                batch.id = batch.id,
                recipes.total = recipes_total,
                recipes.completed = recipes_completed,
                "批次指标已更新"
            );
        }
        tx.commit().await?;
        Ok(Vec::new())
    }
}
