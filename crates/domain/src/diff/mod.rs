//! 两个配方定义修订之间的差异
//!
//! 按新定义的依赖顺序逐节点比较，父节点的变化沿图向下传递；
//! 再叠加强制重新处理的覆盖，得出复制、取代、递归取代、撤回发布四类节点集合。

pub mod node;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use orchestrator_core::OrchestratorResult;
use serde::{Deserialize, Serialize};

use crate::definition::RecipeDefinition;
use crate::forced_nodes::ForcedNodes;

pub use node::{Change, DiffStatus, NodeDiff};

pub const DIFF_SCHEMA_VERSION: &str = "7";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeDiff {
    pub can_be_reprocessed: bool,
    pub reasons: Vec<Reason>,
    pub forced_nodes: Option<ForcedNodes>,
    graph: BTreeMap<String, NodeDiff>,
}

impl RecipeDiff {
    /// 计算 `prev_definition` -> `definition` 的差异
    ///
    /// 任一定义无法给出依赖顺序时返回错误，不产生部分结果。
    pub fn new(
        prev_definition: &RecipeDefinition,
        definition: &RecipeDefinition,
    ) -> OrchestratorResult<Self> {
        let mut diff = Self {
            can_be_reprocessed: true,
            reasons: Vec::new(),
            forced_nodes: None,
            graph: BTreeMap::new(),
        };

        if let Err(err) = definition
            .input_interface
            .validate_connection(&prev_definition.input_interface)
        {
            diff.can_be_reprocessed = false;
            diff.reasons.push(Reason {
                name: "INPUT_CHANGE".to_string(),
                description: format!("Input interface has changed: {err}"),
            });
        }

        diff.create_diff_graph(prev_definition, definition)?;
        Ok(diff)
    }

    fn create_diff_graph(
        &mut self,
        prev_definition: &RecipeDefinition,
        definition: &RecipeDefinition,
    ) -> OrchestratorResult<()> {
        for name in definition.get_topological_order()? {
            let Some(node) = definition.node(&name) else {
                continue;
            };
            let mut node_diff = NodeDiff::new(node, DiffStatus::New);
            let mut parent_statuses = Vec::with_capacity(node.parents.len());
            for parent_name in node.parents.keys() {
                if let Some(parent_diff) = self.graph.get_mut(parent_name) {
                    parent_diff.children.insert(name.clone());
                    parent_statuses.push((parent_name.clone(), parent_diff.status));
                }
                node_diff.parents.insert(parent_name.clone());
            }
            if let Some(prev_node) = prev_definition.node(&name) {
                node_diff.compare_to_previous(node, prev_node, &parent_statuses);
            }
            self.graph.insert(name, node_diff);
        }

        for name in prev_definition.get_topological_order()? {
            if self.graph.contains_key(&name) {
                continue;
            }
            let Some(deleted) = prev_definition.node(&name) else {
                continue;
            };
            let mut node_diff = NodeDiff::new(deleted, DiffStatus::Deleted);
            for parent_name in deleted.parents.keys() {
                if let Some(parent_diff) = self.graph.get_mut(parent_name) {
                    parent_diff.children.insert(name.clone());
                }
                node_diff.parents.insert(parent_name.clone());
            }
            self.graph.insert(name, node_diff);
        }
        Ok(())
    }

    /// 应用强制重新处理；被强制的节点把强制传递给全部后代
    pub fn set_force_reprocess(&mut self, forced_nodes: ForcedNodes) {
        let roots: Vec<String> = self
            .graph
            .keys()
            .filter(|name| forced_nodes.is_node_forced_to_reprocess(name))
            .cloned()
            .collect();

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(node_diff) = self.graph.get_mut(&name) {
                node_diff.mark_forced(forced_nodes.get_forced_nodes_for_subrecipe(&name));
                queue.extend(node_diff.children.iter().cloned());
            }
        }

        self.forced_nodes = Some(forced_nodes);
    }

    pub fn node(&self, name: &str) -> Option<&NodeDiff> {
        self.graph.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDiff> {
        self.graph.values()
    }

    fn select(&self, predicate: impl Fn(&NodeDiff) -> bool) -> BTreeSet<String> {
        if !self.can_be_reprocessed {
            return BTreeSet::new();
        }
        self.graph
            .values()
            .filter(|node_diff| predicate(node_diff))
            .map(|node_diff| node_diff.name.clone())
            .collect()
    }

    pub fn get_nodes_to_copy(&self) -> BTreeSet<String> {
        self.select(NodeDiff::should_be_copied)
    }

    /// 需要取代但不递归的节点；与递归取代集合互不相交
    pub fn get_nodes_to_supersede(&self) -> BTreeSet<String> {
        self.select(|n| n.should_be_superseded() && !n.should_be_recursively_superseded())
    }

    pub fn get_nodes_to_recursively_supersede(&self) -> BTreeSet<String> {
        self.select(NodeDiff::should_be_recursively_superseded)
    }

    pub fn get_nodes_to_unpublish(&self) -> BTreeSet<String> {
        self.select(NodeDiff::should_be_unpublished)
    }

    /// 需要递归撤回发布的子配方节点
    pub fn get_nodes_to_recursively_unpublish(&self) -> BTreeSet<String> {
        self.select(|n| n.should_be_unpublished() && n.is_recipe())
    }

    /// 取代集合中的作业节点
    pub fn get_jobs_to_supersede(&self) -> BTreeSet<String> {
        self.select(|n| n.should_be_superseded() && !n.is_recipe())
    }

    /// 取代集合中的子配方节点（不论是否递归）
    pub fn get_subrecipes_to_supersede(&self) -> BTreeSet<String> {
        self.select(|n| n.should_be_superseded() && n.is_recipe())
    }

    pub fn get_jobs_to_unpublish(&self) -> BTreeSet<String> {
        self.select(|n| n.should_be_unpublished() && !n.is_recipe())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let nodes: serde_json::Map<String, serde_json::Value> = self
            .graph
            .iter()
            .map(|(name, node_diff)| (name.clone(), node_diff.to_json()))
            .collect();
        serde_json::json!({
            "version": DIFF_SCHEMA_VERSION,
            "can_be_reprocessed": self.can_be_reprocessed,
            "reasons": self.reasons,
            "nodes": nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Interface, Parameter};

    fn base() -> RecipeDefinition {
        let input = Interface::new().with_parameter(Parameter::file("INPUT", true, false));
        let mut definition = RecipeDefinition::new(input);
        definition.add_job_node("a", "job-a", "1.0", 1).unwrap();
        definition.add_job_node("b", "job-b", "1.0", 1).unwrap();
        definition.add_recipe_node("sub", "sub-recipe", 1).unwrap();
        definition.add_job_node("c", "job-c", "1.0", 1).unwrap();
        definition.add_dependency("a", "b", true).unwrap();
        definition.add_dependency("a", "sub", true).unwrap();
        definition.add_recipe_input_connection("a", "IN", "INPUT").unwrap();
        definition
    }

    #[test]
    fn test_identical_definitions_copy_everything() {
        let diff = RecipeDiff::new(&base(), &base()).unwrap();
        assert!(diff.can_be_reprocessed);
        assert_eq!(diff.get_nodes_to_copy().len(), 4);
        assert!(diff.get_nodes_to_supersede().is_empty());
        assert!(diff.get_nodes_to_recursively_supersede().is_empty());
    }

    #[test]
    fn test_changed_parent_propagates() {
        let prev = base();
        let mut next = RecipeDefinition::new(prev.input_interface.clone());
        next.add_job_node("a", "job-a", "1.0", 2).unwrap();
        next.add_job_node("b", "job-b", "1.0", 1).unwrap();
        next.add_recipe_node("sub", "sub-recipe", 1).unwrap();
        next.add_job_node("c", "job-c", "1.0", 1).unwrap();
        next.add_dependency("a", "b", true).unwrap();
        next.add_dependency("a", "sub", true).unwrap();
        next.add_recipe_input_connection("a", "IN", "INPUT").unwrap();

        let diff = RecipeDiff::new(&prev, &next).unwrap();
        assert_eq!(diff.node("a").unwrap().status, DiffStatus::Changed);
        assert_eq!(diff.node("b").unwrap().status, DiffStatus::Changed);
        assert_eq!(diff.node("b").unwrap().changes[0].name, "PARENT_CHANGED");
        assert_eq!(
            diff.get_nodes_to_copy(),
            BTreeSet::from(["c".to_string()])
        );
        assert_eq!(
            diff.get_nodes_to_supersede(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            diff.get_nodes_to_recursively_supersede(),
            BTreeSet::from(["sub".to_string()])
        );
    }

    #[test]
    fn test_deleted_and_new_nodes() {
        let prev = base();
        let mut next = RecipeDefinition::new(prev.input_interface.clone());
        next.add_job_node("a", "job-a", "1.0", 1).unwrap();
        next.add_job_node("b", "job-b", "1.0", 1).unwrap();
        next.add_job_node("d", "job-d", "1.0", 1).unwrap();
        next.add_dependency("a", "b", true).unwrap();
        next.add_dependency("b", "d", true).unwrap();
        next.add_recipe_input_connection("a", "IN", "INPUT").unwrap();

        let diff = RecipeDiff::new(&prev, &next).unwrap();
        assert_eq!(diff.node("d").unwrap().status, DiffStatus::New);
        assert_eq!(diff.node("sub").unwrap().status, DiffStatus::Deleted);
        assert_eq!(
            diff.get_nodes_to_unpublish(),
            BTreeSet::from(["c".to_string(), "sub".to_string()])
        );
        assert_eq!(
            diff.get_nodes_to_recursively_unpublish(),
            BTreeSet::from(["sub".to_string()])
        );
        assert_eq!(
            diff.get_nodes_to_copy(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(!diff.get_nodes_to_copy().contains("d"));
        assert!(!diff.get_nodes_to_supersede().contains("d"));
    }

    #[test]
    fn test_input_interface_change_blocks_reprocess() {
        let prev = base();
        let mut next = base();
        next.input_interface = Interface::new()
            .with_parameter(Parameter::file("INPUT", true, false))
            .with_parameter(Parameter::json("EXTRA", "string", true));

        let diff = RecipeDiff::new(&prev, &next).unwrap();
        assert!(!diff.can_be_reprocessed);
        assert_eq!(diff.reasons[0].name, "INPUT_CHANGE");
        assert!(diff.get_nodes_to_copy().is_empty());
        assert!(diff.get_nodes_to_supersede().is_empty());
    }

    #[test]
    fn test_forced_nodes() {
        let mut diff = RecipeDiff::new(&base(), &base()).unwrap();
        let mut forced = ForcedNodes::new();
        forced.add_node("a");
        diff.set_force_reprocess(forced);

        assert!(diff.node("b").unwrap().force_reprocess);
        assert_eq!(
            diff.get_nodes_to_copy(),
            BTreeSet::from(["c".to_string()])
        );
        assert_eq!(
            diff.get_nodes_to_recursively_supersede(),
            BTreeSet::from(["sub".to_string()])
        );

        let mut partial = RecipeDiff::new(&base(), &base()).unwrap();
        let mut inner = ForcedNodes::new();
        inner.add_node("x");
        let mut forced = ForcedNodes::new();
        forced.add_subrecipe("sub", inner);
        partial.set_force_reprocess(forced);
        assert!(partial.get_nodes_to_recursively_supersede().is_empty());
        assert_eq!(
            partial.get_nodes_to_supersede(),
            BTreeSet::from(["sub".to_string()])
        );
        assert!(partial.node("sub").unwrap().reprocess_new_node);
    }

    #[test]
    fn test_diff_json() {
        let diff = RecipeDiff::new(&base(), &base()).unwrap();
        let json = diff.to_json();
        assert_eq!(json["version"], "7");
        assert_eq!(json["nodes"]["b"]["status"], "UNCHANGED");
        assert_eq!(json["nodes"]["b"]["dependencies"][0]["name"], "a");
    }
}
