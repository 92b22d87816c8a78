//! 为配方中的作业节点创建作业

use std::collections::BTreeMap;

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{Job, RecipeNode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CommandContext, CommandMessage, ProcessJobInput, UpdateRecipeMetrics};

/// 配方中待创建的一个作业节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeJob {
    pub job_type_name: String,
    pub job_type_version: String,
    pub job_type_rev_num: i32,
    pub node_name: String,
    #[serde(default)]
    pub process_input: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobs {
    pub recipe_id: i64,
    /// 配方树的根
    pub root_recipe_id: i64,
    #[serde(default)]
    pub superseded_recipe_id: Option<i64>,
    pub event_id: i64,
    #[serde(default)]
    pub batch_id: Option<i64>,
    pub recipe_jobs: Vec<RecipeJob>,
}

impl CreateJobs {
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = ctx.store.begin().await?;
        tx.lock_recipes(&[self.recipe_id])
            .await?
            .pop()
            .ok_or(OrchestratorError::RecipeNotFound { id: self.recipe_id })?;

        let existing: BTreeMap<String, i64> = tx
            .get_recipe_nodes(self.recipe_id)
            .await?
            .into_iter()
            .filter_map(|node| node.job_id.map(|job_id| (node.node_name, job_id)))
            .collect();

        let superseded_jobs: BTreeMap<String, Job> = match self.superseded_recipe_id {
            Some(superseded_id) => {
                let nodes: BTreeMap<i64, String> = tx
                    .get_recipe_nodes(superseded_id)
                    .await?
                    .into_iter()
                    .filter_map(|node| node.job_id.map(|job_id| (job_id, node.node_name)))
                    .collect();
                let job_ids: Vec<i64> = nodes.keys().copied().collect();
                tx.get_jobs(&job_ids)
                    .await?
                    .into_iter()
                    .filter_map(|job| nodes.get(&job.id).cloned().map(|name| (name, job)))
                    .collect()
            }
            None => BTreeMap::new(),
        };

        let mut new_jobs = Vec::new();
        for recipe_job in &self.recipe_jobs {
            if existing.contains_key(&recipe_job.node_name) {
                continue;
            }
            let job_type = tx
                .get_job_type(&recipe_job.job_type_name, &recipe_job.job_type_version)
                .await?
                .ok_or_else(|| OrchestratorError::JobTypeNotFound {
                    name: recipe_job.job_type_name.clone(),
                    version: recipe_job.job_type_version.clone(),
                })?;
            if !job_type.is_active {
                warn!(
                    recipe.id = self.recipe_id,
                    job_type = %job_type.name,
                    version = %job_type.version,
                    "作业类型未激活，不创建作业"
                );
                return Ok(Vec::new());
            }
            let mut job = Job::new(&job_type, self.event_id, when);
            job.recipe_id = Some(self.recipe_id);
            job.root_recipe_id = Some(self.root_recipe_id);
            job.batch_id = self.batch_id;
            job.node_name = Some(recipe_job.node_name.clone());
            if let Some(superseded) = superseded_jobs.get(&recipe_job.node_name) {
                job = job.superseding(superseded);
            }
            new_jobs.push(job);
        }

        let created = tx.create_jobs(new_jobs).await?;
        let recipe_nodes: Vec<RecipeNode> = created
            .iter()
            .filter_map(|job| {
                job.node_name
                    .as_ref()
                    .map(|name| RecipeNode::for_job(self.recipe_id, name.clone(), job.id))
            })
            .collect();
        tx.create_recipe_nodes(recipe_nodes).await?;

        let mut job_ids: BTreeMap<String, i64> = existing;
        for job in &created {
            if let Some(name) = &job.node_name {
                job_ids.insert(name.clone(), job.id);
            }
        }
        let all_jobs: BTreeMap<i64, Job> = {
            let ids: Vec<i64> = self
                .recipe_jobs
                .iter()
                .filter_map(|recipe_job| job_ids.get(&recipe_job.node_name).copied())
                .collect();
            tx.get_jobs(&ids)
                .await?
                .into_iter()
                .map(|job| (job.id, job))
                .collect()
        };
        tx.commit().await?;

        if !created.is_empty() {
            info!(
                recipe.id = self.recipe_id,
                count = created.len(),
                "配方作业已创建"
            );
        }

        let process_ids: Vec<i64> = self
            .recipe_jobs
            .iter()
            .filter_map(|recipe_job| {
                let job = all_jobs.get(job_ids.get(&recipe_job.node_name)?)?;
                (recipe_job.process_input || job.has_input()).then_some(job.id)
            })
            .collect();

        let mut messages = super::chunked(&process_ids, ctx.max_num(), |job_ids| {
            CommandMessage::ProcessJobInput(ProcessJobInput { job_ids })
        });
        messages.push(CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
            recipe_ids: vec![self.recipe_id],
        }));
        Ok(messages)
    }
}
