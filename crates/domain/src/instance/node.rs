use std::collections::{BTreeMap, BTreeSet};

use crate::definition::NodeDefinition;
use crate::entities::{Job, JobStatus, Recipe};

/// 节点在配方实例中的具体形态
#[derive(Debug, Clone)]
pub enum NodeKind {
    Job(Job),
    SubRecipe(Recipe),
    /// 尚未创建的节点占位
    Dummy,
}

/// 配方实例中的一个节点
///
/// 父子关系只记录节点名，传播所需的父节点状态由 [`super::RecipeInstance`]
/// 按依赖顺序收集后传入。
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub definition: NodeDefinition,
    pub kind: NodeKind,
    /// 父节点名 -> acceptance
    pub parents: BTreeMap<String, bool>,
    pub children: BTreeSet<String>,
    pub already_created: bool,
    pub children_can_be_created: bool,
    pub blocks_child_nodes: bool,
    pub is_original: bool,
}

impl NodeInstance {
    pub fn job(definition: NodeDefinition, job: Job, is_original: bool) -> Self {
        Self::new(definition, NodeKind::Job(job), is_original)
    }

    pub fn sub_recipe(definition: NodeDefinition, recipe: Recipe, is_original: bool) -> Self {
        Self::new(definition, NodeKind::SubRecipe(recipe), is_original)
    }

    pub fn dummy(definition: NodeDefinition) -> Self {
        let mut node = Self::new(definition, NodeKind::Dummy, true);
        node.already_created = false;
        node
    }

    fn new(definition: NodeDefinition, kind: NodeKind, is_original: bool) -> Self {
        Self {
            definition,
            kind,
            parents: BTreeMap::new(),
            children: BTreeSet::new(),
            already_created: true,
            children_can_be_created: true,
            blocks_child_nodes: false,
            is_original,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_real_node(&self) -> bool {
        !matches!(self.kind, NodeKind::Dummy)
    }

    pub fn job_id(&self) -> Option<i64> {
        match &self.kind {
            NodeKind::Job(job) => Some(job.id),
            _ => None,
        }
    }

    pub fn sub_recipe_id(&self) -> Option<i64> {
        match &self.kind {
            NodeKind::SubRecipe(recipe) => Some(recipe.id),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        match &self.kind {
            NodeKind::Job(job) => job.is_ready_for_children(),
            NodeKind::SubRecipe(recipe) => recipe.is_completed,
            NodeKind::Dummy => false,
        }
    }

    pub fn is_ready_for_children(&self) -> bool {
        match &self.kind {
            NodeKind::Dummy => false,
            _ => self.is_completed(),
        }
    }

    /// 未创建且所有父节点都允许创建子节点时需要创建
    ///
    /// 同时重新计算本节点的 `children_can_be_created`，供子节点使用。
    pub fn needs_to_be_created(
        &mut self,
        parents_children_can_be_created: impl IntoIterator<Item = bool>,
    ) -> bool {
        let mut needs_to_be_created = !self.already_created;
        self.children_can_be_created = true;
        if needs_to_be_created
            && parents_children_can_be_created
                .into_iter()
                .any(|can_be_created| !can_be_created)
        {
            needs_to_be_created = false;
            self.children_can_be_created = false;
        }
        needs_to_be_created
    }

    /// 所有父节点已就绪且本节点还没有输入时需要处理输入
    pub fn needs_to_process_input(&self, parents_ready: bool) -> bool {
        if !parents_ready {
            return false;
        }
        match &self.kind {
            NodeKind::Job(job) => {
                matches!(job.status, JobStatus::Pending | JobStatus::Blocked) && !job.has_input()
            }
            NodeKind::SubRecipe(recipe) => !recipe.has_input(),
            NodeKind::Dummy => true,
        }
    }

    /// 计算本节点是否阻塞子节点，并收集需要切换到 PENDING/BLOCKED 的作业
    pub fn get_jobs_to_update(
        &mut self,
        parents_block: bool,
        pending_job_ids: &mut Vec<i64>,
        blocked_job_ids: &mut Vec<i64>,
    ) {
        self.blocks_child_nodes = parents_block;
        match &self.kind {
            NodeKind::Job(job) => {
                if matches!(job.status, JobStatus::Canceled | JobStatus::Failed) {
                    self.blocks_child_nodes = true;
                }
                if job.status == JobStatus::Blocked && !self.blocks_child_nodes {
                    pending_job_ids.push(job.id);
                }
                if job.status == JobStatus::Pending && self.blocks_child_nodes {
                    blocked_job_ids.push(job.id);
                }
            }
            NodeKind::SubRecipe(recipe) => {
                if recipe.counts.blocking_jobs() > 0 {
                    self.blocks_child_nodes = true;
                }
            }
            NodeKind::Dummy => {}
        }
    }
}
