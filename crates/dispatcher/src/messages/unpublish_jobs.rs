//! 撤回作业产品

use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CommandContext, CommandMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpublishJobs {
    pub job_ids: Vec<i64>,
    pub when: DateTime<Utc>,
}

impl UnpublishJobs {
    pub fn messages(job_ids: &[i64], when: DateTime<Utc>, max_num: usize) -> Vec<CommandMessage> {
        super::chunked(job_ids, max_num, |job_ids| {
            CommandMessage::UnpublishJobs(UnpublishJobs { job_ids, when })
        })
    }

    /// 已撤回的作业保留最初的撤回时间
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut tx = ctx.store.begin().await?;
        let mut unpublished = 0usize;
        for mut job in tx.lock_jobs(&self.job_ids).await? {
            if job.unpublished.is_some() {
                continue;
            }
            job.unpublished = Some(self.when);
            tx.update_job(&job).await?;
            unpublished += 1;
        }
        tx.commit().await?;

        info!(requested = self.job_ids.len(), unpublished, "作业产品已撤回");
        Ok(Vec::new())
    }
}
