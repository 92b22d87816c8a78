//! 取代配方中的节点
//!
//! 被取代的作业随后取消，删除节点的作业撤回产品；递归集合中的子配方
//! 生成针对子配方内部全部节点的新消息，直到没有递归集合为止。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::RecipeDiff;
use orchestrator_infrastructure::StructuredLogger;
use serde::{Deserialize, Serialize};

use super::{CancelJobs, CommandContext, CommandMessage, UnpublishJobs};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupersedeRecipeNodes {
    pub recipe_ids: Vec<i64>,
    pub when: DateTime<Utc>,
    pub supersede_all: bool,
    pub supersede_jobs: BTreeSet<String>,
    pub supersede_subrecipes: BTreeSet<String>,
    pub unpublish_all: bool,
    pub unpublish_jobs: BTreeSet<String>,
    pub supersede_recursive_all: bool,
    pub supersede_recursive: BTreeSet<String>,
    pub unpublish_recursive_all: bool,
    pub unpublish_recursive: BTreeSet<String>,
}

impl SupersedeRecipeNodes {
    /// 按差异结果取代上一版本配方中的节点
    pub fn messages_from_diff(
        recipe_ids: &[i64],
        diff: &RecipeDiff,
        when: DateTime<Utc>,
        max_num: usize,
    ) -> Vec<CommandMessage> {
        let template = SupersedeRecipeNodes {
            recipe_ids: Vec::new(),
            when,
            supersede_jobs: diff.get_jobs_to_supersede(),
            supersede_subrecipes: diff.get_subrecipes_to_supersede(),
            unpublish_jobs: diff.get_jobs_to_unpublish(),
            supersede_recursive: diff.get_nodes_to_recursively_supersede(),
            unpublish_recursive: diff.get_nodes_to_recursively_unpublish(),
            ..SupersedeRecipeNodes::default()
        };
        if !template.has_work() {
            return Vec::new();
        }
        super::chunked(recipe_ids, max_num, |recipe_ids| {
            CommandMessage::SupersedeRecipeNodes(SupersedeRecipeNodes {
                recipe_ids,
                ..template.clone()
            })
        })
    }

    /// 取代子配方内的全部节点；`unpublish` 时同时撤回全部产品
    pub fn recursive(recipe_ids: Vec<i64>, when: DateTime<Utc>, unpublish: bool) -> Self {
        SupersedeRecipeNodes {
            recipe_ids,
            when,
            supersede_all: true,
            supersede_recursive_all: true,
            unpublish_all: unpublish,
            unpublish_recursive_all: unpublish,
            ..SupersedeRecipeNodes::default()
        }
    }

    fn has_work(&self) -> bool {
        self.supersede_all
            || self.unpublish_all
            || self.supersede_recursive_all
            || self.unpublish_recursive_all
            || !self.supersede_jobs.is_empty()
            || !self.supersede_subrecipes.is_empty()
            || !self.unpublish_jobs.is_empty()
            || !self.supersede_recursive.is_empty()
            || !self.unpublish_recursive.is_empty()
    }

    fn supersedes_job(&self, node_name: &str) -> bool {
        self.supersede_all || self.supersede_jobs.contains(node_name)
    }

    fn unpublishes_job(&self, node_name: &str) -> bool {
        self.unpublish_all || self.unpublish_jobs.contains(node_name)
    }

    fn supersedes_sub_recipe(&self, node_name: &str) -> bool {
        self.supersede_all
            || self.supersede_subrecipes.contains(node_name)
            || self.recursively_supersedes(node_name)
            || self.recursively_unpublishes(node_name)
    }

    fn recursively_supersedes(&self, node_name: &str) -> bool {
        self.supersede_recursive_all || self.supersede_recursive.contains(node_name)
    }

    fn recursively_unpublishes(&self, node_name: &str) -> bool {
        self.unpublish_recursive_all || self.unpublish_recursive.contains(node_name)
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut superseded_jobs = Vec::new();
        let mut unpublished_jobs = Vec::new();
        let mut superseded_sub_recipes = Vec::new();
        let mut recursive_supersede = Vec::new();
        let mut recursive_unpublish = Vec::new();

        let mut tx = ctx.store.begin().await?;
        for recipe_id in &self.recipe_ids {
            let (mut jobs, mut sub_recipes) = (0usize, 0usize);
            for node in tx.get_recipe_nodes(*recipe_id).await? {
                if let Some(job_id) = node.job_id {
                    if self.supersedes_job(&node.node_name) {
                        superseded_jobs.push(job_id);
                        jobs += 1;
                    }
                    if self.unpublishes_job(&node.node_name) {
                        unpublished_jobs.push(job_id);
                    }
                }
                if let Some(sub_recipe_id) = node.sub_recipe_id {
                    if self.supersedes_sub_recipe(&node.node_name) {
                        superseded_sub_recipes.push(sub_recipe_id);
                        sub_recipes += 1;
                    }
                    if self.recursively_unpublishes(&node.node_name) {
                        recursive_unpublish.push(sub_recipe_id);
                    } else if self.recursively_supersedes(&node.node_name) {
                        recursive_supersede.push(sub_recipe_id);
                    }
                }
            }
            StructuredLogger::log_nodes_superseded(
                *recipe_id,
                jobs,
                sub_recipes,
                self.unpublish_all || !self.unpublish_jobs.is_empty(),
            );
        }
        tx.supersede_jobs(&superseded_jobs, self.when).await?;
        tx.supersede_recipes(&superseded_sub_recipes, self.when).await?;
        tx.commit().await?;

        ctx.metrics
            .record_nodes_superseded(superseded_jobs.len() + superseded_sub_recipes.len());

        let max_num = ctx.max_num();
        let mut messages = CancelJobs::messages(&superseded_jobs, self.when, max_num);
        messages.extend(UnpublishJobs::messages(&unpublished_jobs, self.when, max_num));
        messages.extend(super::chunked(&recursive_unpublish, max_num, |ids| {
            CommandMessage::SupersedeRecipeNodes(Self::recursive(ids, self.when, true))
        }));
        messages.extend(super::chunked(&recursive_supersede, max_num, |ids| {
            CommandMessage::SupersedeRecipeNodes(Self::recursive(ids, self.when, false))
        }));
        Ok(messages)
    }
}
