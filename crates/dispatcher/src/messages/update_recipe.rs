//! 根据配方实例的当前状态推进配方
//!
//! 更新阻塞/待定作业，创建可以创建的节点，为已创建但缺少输入的节点处理输入。
//! 全部节点完成时配方完成；子配方完成后会继续更新父配方。

use std::collections::BTreeSet;

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::store::load_recipe_instance;
use orchestrator_domain::{ForcedNodes, NodeKind, NodeType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    BlockedJobs, CommandContext, CommandMessage, CreateJobs, CreateRecipes, PendingJobs,
    ProcessJobInput, ProcessRecipeInput, RecipeJob, SubRecipe, UpdateRecipeMetrics,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecipe {
    /// 取代链的根；实际更新的是链上最新的配方
    pub root_recipe_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_nodes: Option<ForcedNodes>,
}

impl UpdateRecipe {
    pub fn new(root_recipe_id: i64, forced_nodes: Option<ForcedNodes>) -> Self {
        Self {
            root_recipe_id,
            forced_nodes,
        }
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let max_num = ctx.max_num();
        let mut tx = ctx.store.begin().await?;
        let recipe = tx
            .lock_latest_recipes(&[self.root_recipe_id])
            .await?
            .pop()
            .ok_or(OrchestratorError::RecipeNotFound {
                id: self.root_recipe_id,
            })?;
        let (_, mut instance) = load_recipe_instance(tx.as_mut(), recipe).await?;

        let jobs_to_update = instance.get_jobs_to_update();
        let nodes_to_create = instance.get_nodes_to_create();
        let mut process_input: BTreeSet<String> =
            instance.get_nodes_to_process_input().into_iter().collect();

        let mut messages = BlockedJobs::messages(&jobs_to_update.blocked, when, max_num);
        messages.extend(PendingJobs::messages(&jobs_to_update.pending, when, max_num));

        let recipe = instance.recipe.clone();
        let mut recipe_jobs = Vec::new();
        let mut sub_recipes = Vec::new();
        for node in &nodes_to_create {
            let node_process_input = process_input.remove(&node.name);
            match &node.node_type {
                NodeType::Job {
                    job_type_name,
                    job_type_version,
                    revision_num,
                } => recipe_jobs.push(RecipeJob {
                    job_type_name: job_type_name.clone(),
                    job_type_version: job_type_version.clone(),
                    job_type_rev_num: *revision_num,
                    node_name: node.name.clone(),
                    process_input: node_process_input,
                }),
                NodeType::Recipe {
                    recipe_type_name,
                    revision_num,
                } => sub_recipes.push(SubRecipe {
                    recipe_type_name: recipe_type_name.clone(),
                    recipe_type_rev_num: *revision_num,
                    node_name: node.name.clone(),
                    process_input: node_process_input,
                }),
            }
        }
        if !recipe_jobs.is_empty() {
            messages.push(CommandMessage::CreateJobs(CreateJobs {
                recipe_id: recipe.id,
                root_recipe_id: recipe.tree_root_id(),
                superseded_recipe_id: recipe.superseded_recipe_id,
                event_id: recipe.event_id,
                batch_id: recipe.batch_id,
                recipe_jobs,
            }));
        }
        if !sub_recipes.is_empty() {
            messages.push(CommandMessage::CreateRecipes(CreateRecipes::sub_recipes(
                &recipe,
                sub_recipes,
                self.forced_nodes.clone(),
            )));
        }

        let mut job_ids = Vec::new();
        let mut sub_recipe_ids = Vec::new();
        for name in &process_input {
            let Some(node) = instance.node(name) else {
                continue;
            };
            match &node.kind {
                NodeKind::Job(job) => job_ids.push(job.id),
                NodeKind::SubRecipe(sub_recipe) => sub_recipe_ids.push(sub_recipe.id),
                NodeKind::Dummy => {}
            }
        }
        messages.extend(super::chunked(&job_ids, max_num, |job_ids| {
            CommandMessage::ProcessJobInput(ProcessJobInput { job_ids })
        }));
        messages.extend(super::chunked(&sub_recipe_ids, max_num, |recipe_ids| {
            CommandMessage::ProcessRecipeInput(ProcessRecipeInput {
                recipe_ids,
                forced_nodes: None,
            })
        }));

        if !recipe.is_completed && instance.has_completed() {
            let mut completed = recipe.clone();
            completed.is_completed = true;
            completed.completed = Some(when);
            completed.updated_at = when;
            tx.update_recipe(&completed).await?;
            info!(recipe.id = recipe.id, "配方已完成");

            if let Some(parent_id) = recipe.recipe_id {
                messages.push(CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
                    recipe_ids: vec![recipe.id],
                }));
                if let Some(parent) = tx.get_recipes(&[parent_id]).await?.pop() {
                    messages.push(CommandMessage::UpdateRecipe(UpdateRecipe::new(
                        parent.root_superseded_recipe_id,
                        None,
                    )));
                }
            }
        }
        tx.commit().await?;

        debug!(
            recipe.id = recipe.id,
            messages = messages.len(),
            "配方已更新"
        );
        Ok(messages)
    }
}
