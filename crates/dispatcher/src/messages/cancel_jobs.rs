//! 通过队列的取消路径逐个取消作业

use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CommandContext, CommandMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelJobs {
    pub job_ids: Vec<i64>,
    pub when: DateTime<Utc>,
}

impl CancelJobs {
    pub fn messages(job_ids: &[i64], when: DateTime<Utc>, max_num: usize) -> Vec<CommandMessage> {
        super::chunked(job_ids, max_num, |job_ids| {
            CommandMessage::CancelJobs(CancelJobs { job_ids, when })
        })
    }

    /// 已完成或已取消的作业跳过
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut messages = Vec::new();
        for job_id in &self.job_ids {
            match ctx
                .queue_manager
                .handle_job_cancellation(*job_id, self.when)
                .await
            {
                Ok(follow_ups) => messages.extend(follow_ups),
                Err(OrchestratorError::InvalidStatus(reason)) => {
                    debug!(job.id = job_id, reason = %reason, "作业不需要取消");
                }
                Err(OrchestratorError::JobNotFound { id }) => {
                    warn!(job.id = id, "要取消的作业不存在");
                }
                Err(e) => return Err(e),
            }
        }
        dedup_messages(&mut messages);
        Ok(messages)
    }
}

/// 同一配方的多个作业会产生相同的后续消息
pub(crate) fn dedup_messages(messages: &mut Vec<CommandMessage>) {
    let mut unique: Vec<CommandMessage> = Vec::with_capacity(messages.len());
    for message in messages.drain(..) {
        if !unique.contains(&message) {
            unique.push(message);
        }
    }
    *messages = unique;
}
