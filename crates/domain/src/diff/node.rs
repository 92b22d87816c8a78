use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::definition::{NodeDefinition, NodeType};
use crate::forced_nodes::ForcedNodes;

/// 节点相对上一修订的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffStatus {
    #[serde(rename = "UNCHANGED")]
    Unchanged,
    #[serde(rename = "CHANGED")]
    Changed,
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "DELETED")]
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub name: String,
    pub description: String,
}

impl Change {
    fn new(name: &str, description: String) -> Self {
        Self {
            name: name.to_string(),
            description,
        }
    }
}

/// 单个节点的差异
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDiff {
    pub name: String,
    pub node_type: NodeType,
    pub prev_node_type: Option<NodeType>,
    pub status: DiffStatus,
    pub reprocess_new_node: bool,
    pub force_reprocess: bool,
    pub changes: Vec<Change>,
    pub parents: BTreeSet<String>,
    pub children: BTreeSet<String>,
    /// 子配方节点：显式指定的内部强制集合
    pub force_reprocess_nodes: Option<ForcedNodes>,
}

impl NodeDiff {
    pub(crate) fn new(node: &NodeDefinition, status: DiffStatus) -> Self {
        let mut diff = Self {
            name: node.name.clone(),
            node_type: node.node_type.clone(),
            prev_node_type: None,
            status,
            reprocess_new_node: false,
            force_reprocess: false,
            changes: Vec::new(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            force_reprocess_nodes: None,
        };
        diff.calculate_reprocess_new_node();
        diff
    }

    pub fn is_recipe(&self) -> bool {
        self.node_type.is_recipe()
    }

    /// 与上一修订中的同名节点比较；`parent_statuses` 为本节点各父节点的最新状态
    pub(crate) fn compare_to_previous(
        &mut self,
        node: &NodeDefinition,
        prev_node: &NodeDefinition,
        parent_statuses: &[(String, DiffStatus)],
    ) {
        self.changes.clear();

        self.compare_node_type(&prev_node.node_type);

        for (parent_name, status) in parent_statuses {
            match status {
                DiffStatus::Changed => self.changes.push(Change::new(
                    "PARENT_CHANGED",
                    format!("Parent node {parent_name} changed"),
                )),
                DiffStatus::New => self.changes.push(Change::new(
                    "PARENT_NEW",
                    format!("New parent node {parent_name} added"),
                )),
                _ => {}
            }
        }
        for prev_parent in prev_node.parents.keys() {
            if !node.parents.contains_key(prev_parent) {
                self.changes.push(Change::new(
                    "PARENT_REMOVED",
                    format!("Previous parent node {prev_parent} removed"),
                ));
            }
        }

        for (input_name, connection) in &node.connections {
            match prev_node.connections.get(input_name) {
                None => self.changes.push(Change::new(
                    "INPUT_NEW",
                    format!("New input {input_name} added"),
                )),
                Some(prev_connection) if prev_connection != connection => self.changes.push(
                    Change::new("INPUT_CHANGE", format!("Input {input_name} changed")),
                ),
                Some(_) => {}
            }
        }
        for prev_input in prev_node.connections.keys() {
            if !node.connections.contains_key(prev_input) {
                self.changes.push(Change::new(
                    "INPUT_REMOVED",
                    format!("Previous input {prev_input} removed"),
                ));
            }
        }

        self.status = if self.changes.is_empty() {
            DiffStatus::Unchanged
        } else {
            DiffStatus::Changed
        };
        self.calculate_reprocess_new_node();
    }

    fn compare_node_type(&mut self, prev: &NodeType) {
        match (&self.node_type, prev) {
            (
                NodeType::Job {
                    job_type_name,
                    job_type_version,
                    revision_num,
                },
                NodeType::Job {
                    job_type_name: prev_name,
                    job_type_version: prev_version,
                    revision_num: prev_revision,
                },
            ) => {
                let mut changes = Vec::new();
                if job_type_name != prev_name {
                    changes.push(Change::new(
                        "JOB_TYPE_CHANGE",
                        format!("Job type changed from {prev_name} to {job_type_name}"),
                    ));
                }
                if job_type_version != prev_version {
                    changes.push(Change::new(
                        "JOB_TYPE_VERSION_CHANGE",
                        format!(
                            "Job type version changed from {prev_version} to {job_type_version}"
                        ),
                    ));
                }
                if revision_num != prev_revision {
                    changes.push(Change::new(
                        "JOB_TYPE_REVISION_CHANGE",
                        format!("Job type revision changed from {prev_revision} to {revision_num}"),
                    ));
                }
                if !changes.is_empty() {
                    self.prev_node_type = Some(prev.clone());
                }
                self.changes.extend(changes);
            }
            (
                NodeType::Recipe {
                    recipe_type_name,
                    revision_num,
                },
                NodeType::Recipe {
                    recipe_type_name: prev_name,
                    revision_num: prev_revision,
                },
            ) => {
                let mut changes = Vec::new();
                if recipe_type_name != prev_name {
                    changes.push(Change::new(
                        "RECIPE_TYPE_CHANGE",
                        format!("Recipe type changed from {prev_name} to {recipe_type_name}"),
                    ));
                }
                if revision_num != prev_revision {
                    changes.push(Change::new(
                        "RECIPE_TYPE_REVISION_CHANGE",
                        format!(
                            "Recipe type revision changed from {prev_revision} to {revision_num}"
                        ),
                    ));
                }
                if !changes.is_empty() {
                    self.prev_node_type = Some(prev.clone());
                }
                self.changes.extend(changes);
            }
            _ => {
                self.prev_node_type = Some(prev.clone());
                self.changes.push(Change::new(
                    "NODE_TYPE_CHANGE",
                    format!(
                        "Node type changed from {} to {}",
                        prev.type_name(),
                        self.node_type.type_name()
                    ),
                ));
            }
        }
    }

    pub(crate) fn mark_forced(&mut self, sub_forced: Option<ForcedNodes>) {
        self.force_reprocess = true;
        if self.is_recipe() && sub_forced.is_some() {
            self.force_reprocess_nodes = sub_forced;
        }
        self.calculate_reprocess_new_node();
    }

    fn calculate_reprocess_new_node(&mut self) {
        let due_to_status = matches!(self.status, DiffStatus::Changed | DiffStatus::New);
        let due_to_force = self.force_reprocess && self.status != DiffStatus::Deleted;
        self.reprocess_new_node = due_to_status || due_to_force;
    }

    /// 保留在上一配方中、直接复制到新配方
    pub fn should_be_copied(&self) -> bool {
        self.status != DiffStatus::Deleted && !self.reprocess_new_node
    }

    /// 上一配方中的行需要被取代（删除或被替换）
    pub fn should_be_superseded(&self) -> bool {
        let being_deleted = self.status == DiffStatus::Deleted;
        let being_replaced = self.status == DiffStatus::Changed
            || (self.status == DiffStatus::Unchanged && self.force_reprocess);
        being_deleted || being_replaced
    }

    /// 子配方整体递归取代：自身变更/删除，或被强制且没有部分强制的内部集合
    pub fn should_be_recursively_superseded(&self) -> bool {
        if !self.is_recipe() || !self.should_be_superseded() {
            return false;
        }
        if matches!(self.status, DiffStatus::Changed | DiffStatus::Deleted) {
            return true;
        }
        self.force_reprocess
            && self
                .force_reprocess_nodes
                .as_ref()
                .map_or(true, |forced| forced.all_nodes)
    }

    /// 删除的节点需要撤回已发布的产品
    pub fn should_be_unpublished(&self) -> bool {
        self.status == DiffStatus::Deleted
    }

    pub fn to_json(&self) -> serde_json::Value {
        let node_type = node_type_json(&self.node_type);
        let mut value = serde_json::json!({
            "status": self.status,
            "changes": self.changes,
            "reprocess_new_node": self.reprocess_new_node,
            "force_reprocess": self.force_reprocess,
            "dependencies": self.parents.iter().map(|name| serde_json::json!({"name": name})).collect::<Vec<_>>(),
            "node_type": node_type,
        });
        if let Some(prev) = &self.prev_node_type {
            value["prev_node_type"] = serde_json::Value::String(prev.type_name().to_string());
        }
        value
    }
}

fn node_type_json(node_type: &NodeType) -> serde_json::Value {
    match node_type {
        NodeType::Job {
            job_type_name,
            job_type_version,
            revision_num,
        } => serde_json::json!({
            "node_type": "job",
            "job_type_name": job_type_name,
            "job_type_version": job_type_version,
            "job_type_revision": revision_num,
        }),
        NodeType::Recipe {
            recipe_type_name,
            revision_num,
        } => serde_json::json!({
            "node_type": "recipe",
            "recipe_type_name": recipe_type_name,
            "recipe_type_revision": revision_num,
        }),
    }
}
