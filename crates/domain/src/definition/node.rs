use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// 配方图中节点的种类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Job {
        job_type_name: String,
        job_type_version: String,
        revision_num: i32,
    },
    Recipe {
        recipe_type_name: String,
        revision_num: i32,
    },
}

impl NodeType {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeType::Job { .. } => "job",
            NodeType::Recipe { .. } => "recipe",
        }
    }

    pub fn is_recipe(&self) -> bool {
        matches!(self, NodeType::Recipe { .. })
    }
}

/// 节点某个输入的来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputConnection {
    /// 来自配方自身输入
    Recipe {
        input_name: String,
        recipe_input_name: String,
    },
    /// 来自上游节点的输出
    Dependency {
        input_name: String,
        node_name: String,
        output_name: String,
    },
}

impl InputConnection {
    pub fn input_name(&self) -> &str {
        match self {
            InputConnection::Recipe { input_name, .. }
            | InputConnection::Dependency { input_name, .. } => input_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub node_type: NodeType,
    /// 父节点名 -> acceptance
    pub parents: BTreeMap<String, bool>,
    pub children: BTreeSet<String>,
    /// 输入名 -> 连接
    pub connections: BTreeMap<String, InputConnection>,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
            parents: BTreeMap::new(),
            children: BTreeSet::new(),
            connections: BTreeMap::new(),
        }
    }

    pub fn is_recipe(&self) -> bool {
        self.node_type.is_recipe()
    }
}
