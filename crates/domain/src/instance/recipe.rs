use std::collections::BTreeMap;

use orchestrator_core::OrchestratorResult;
use tracing::error;

use super::node::NodeInstance;
use crate::definition::{NodeDefinition, NodeType, RecipeDefinition};
use crate::entities::{Job, Recipe, RecipeNode};

/// 配方节点行及其关联的作业或子配方
#[derive(Debug, Clone)]
pub struct RecipeNodeDetails {
    pub node: RecipeNode,
    pub job: Option<Job>,
    pub sub_recipe: Option<Recipe>,
}

/// 需要切换状态的作业
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobsToUpdate {
    pub pending: Vec<i64>,
    pub blocked: Vec<i64>,
}

/// 正在执行的配方：定义图 + 已创建的节点
#[derive(Debug, Clone)]
pub struct RecipeInstance {
    pub recipe: Recipe,
    order: Vec<String>,
    graph: BTreeMap<String, NodeInstance>,
}

impl RecipeInstance {
    pub fn new(
        definition: &RecipeDefinition,
        recipe: Recipe,
        recipe_nodes: Vec<RecipeNodeDetails>,
    ) -> OrchestratorResult<Self> {
        let mut by_name: BTreeMap<String, RecipeNodeDetails> = recipe_nodes
            .into_iter()
            .map(|details| (details.node.node_name.clone(), details))
            .collect();

        let order = definition.get_topological_order()?;
        let mut graph = BTreeMap::new();
        for name in &order {
            let Some(node_definition) = definition.node(name) else {
                continue;
            };
            let details = by_name.remove(name);
            let mut node = match (details, &node_definition.node_type) {
                (
                    Some(RecipeNodeDetails {
                        node,
                        job: Some(job),
                        ..
                    }),
                    NodeType::Job { .. },
                ) => NodeInstance::job(node_definition.clone(), job, node.is_original),
                (
                    Some(RecipeNodeDetails {
                        node,
                        sub_recipe: Some(sub_recipe),
                        ..
                    }),
                    NodeType::Recipe { .. },
                ) => NodeInstance::sub_recipe(node_definition.clone(), sub_recipe, node.is_original),
                _ => NodeInstance::dummy(node_definition.clone()),
            };
            node.parents = node_definition.parents.clone();
            node.children = node_definition.children.clone();
            graph.insert(name.clone(), node);
        }

        Ok(Self {
            recipe,
            order,
            graph,
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeInstance> {
        self.graph.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInstance> {
        self.order.iter().filter_map(|name| self.graph.get(name))
    }

    fn parent_flags(&self, name: &str, flag: impl Fn(&NodeInstance) -> bool) -> Vec<bool> {
        self.graph
            .get(name)
            .map(|node| {
                node.parents
                    .keys()
                    .filter_map(|parent| self.graph.get(parent))
                    .map(&flag)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 按依赖顺序计算阻塞标记，返回需要切换到 PENDING/BLOCKED 的作业
    pub fn get_jobs_to_update(&mut self) -> JobsToUpdate {
        let mut update = JobsToUpdate::default();
        for name in self.order.clone() {
            let parents_block = self
                .parent_flags(&name, |parent| parent.blocks_child_nodes)
                .into_iter()
                .any(|blocks| blocks);
            if let Some(node) = self.graph.get_mut(&name) {
                node.get_jobs_to_update(parents_block, &mut update.pending, &mut update.blocked);
            }
        }
        update
    }

    /// 需要创建的节点定义（依赖顺序）
    pub fn get_nodes_to_create(&mut self) -> Vec<NodeDefinition> {
        let mut nodes_to_create = Vec::new();
        for name in self.order.clone() {
            let parent_flags = self.parent_flags(&name, |parent| parent.children_can_be_created);
            if let Some(node) = self.graph.get_mut(&name) {
                if node.needs_to_be_created(parent_flags) {
                    nodes_to_create.push(node.definition.clone());
                }
            }
        }
        nodes_to_create
    }

    /// 需要处理输入的节点名；配方本身还没有输入时为空
    pub fn get_nodes_to_process_input(&self) -> Vec<String> {
        if !self.recipe.has_input() {
            return Vec::new();
        }
        self.order
            .iter()
            .filter(|name| {
                let parents_ready = self
                    .parent_flags(name, NodeInstance::is_ready_for_children)
                    .into_iter()
                    .all(|ready| ready);
                self.graph
                    .get(name.as_str())
                    .is_some_and(|node| node.needs_to_process_input(parents_ready))
            })
            .cloned()
            .collect()
    }

    /// 本配方原有（非复制）的叶子节点
    pub fn get_original_leaf_nodes(&self) -> Vec<&NodeInstance> {
        self.nodes()
            .filter(|node| node.is_original && node.is_real_node() && node.children.is_empty())
            .collect()
    }

    pub fn has_completed(&mut self) -> bool {
        if !self.get_nodes_to_create().is_empty() {
            return false;
        }
        for name in &self.order {
            match self.graph.get(name) {
                Some(node) if node.is_completed() => {}
                Some(_) => return false,
                None => {
                    error!(recipe.id = self.recipe.id, node = %name, "Missing recipe node");
                    return false;
                }
            }
        }
        true
    }

    /// 已创建节点的输出，供下游生成输入
    pub fn node_outputs(&self) -> BTreeMap<String, crate::interface::Data> {
        self.graph
            .iter()
            .filter_map(|(name, node)| match &node.kind {
                super::NodeKind::Job(job) => job.output.clone().map(|output| (name.clone(), output)),
                _ => None,
            })
            .collect()
    }
}
