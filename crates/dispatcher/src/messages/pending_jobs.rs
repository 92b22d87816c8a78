//! BLOCKED -> PENDING

use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::JobStatus;
use serde::{Deserialize, Serialize};

use super::blocked_jobs::{recipe_metrics_messages, update_job_status};
use super::{CommandContext, CommandMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJobs {
    pub job_ids: Vec<i64>,
    pub when: DateTime<Utc>,
}

impl PendingJobs {
    pub fn messages(job_ids: &[i64], when: DateTime<Utc>, max_num: usize) -> Vec<CommandMessage> {
        super::chunked(job_ids, max_num, |job_ids| {
            CommandMessage::PendingJobs(PendingJobs { job_ids, when })
        })
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let recipe_ids =
            update_job_status(ctx, &self.job_ids, JobStatus::Blocked, JobStatus::Pending, self.when)
                .await?;
        Ok(recipe_metrics_messages(recipe_ids, ctx.max_num()))
    }
}
