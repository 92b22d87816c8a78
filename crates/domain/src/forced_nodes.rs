//! 强制重新处理的节点集合（可递归描述子配方内部节点）

use std::collections::{BTreeMap, BTreeSet};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

pub const FORCED_NODES_SCHEMA_VERSION: &str = "7";
const SUPPORTED_VERSIONS: [&str; 2] = ["6", "7"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ForcedNodesJson", into = "ForcedNodesJson")]
pub struct ForcedNodes {
    pub all_nodes: bool,
    nodes: BTreeSet<String>,
    sub_recipes: BTreeMap<String, ForcedNodes>,
}

impl ForcedNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 强制全部节点
    pub fn all() -> Self {
        Self {
            all_nodes: true,
            ..Self::default()
        }
    }

    pub fn set_all_nodes(&mut self) {
        self.all_nodes = true;
    }

    pub fn add_node(&mut self, node_name: impl Into<String>) {
        self.nodes.insert(node_name.into());
    }

    /// 为子配方节点指定内部强制集合，节点本身也被强制
    pub fn add_subrecipe(&mut self, node_name: impl Into<String>, forced: ForcedNodes) {
        let node_name = node_name.into();
        self.nodes.insert(node_name.clone());
        self.sub_recipes.insert(node_name, forced);
    }

    pub fn get_forced_node_names(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn get_sub_recipe_names(&self) -> impl Iterator<Item = &String> {
        self.sub_recipes.keys()
    }

    /// 子配方节点的内部强制集合；全部强制时返回全部强制
    pub fn get_forced_nodes_for_subrecipe(&self, node_name: &str) -> Option<ForcedNodes> {
        if self.all_nodes {
            return Some(ForcedNodes::all());
        }
        self.sub_recipes.get(node_name).cloned()
    }

    pub fn is_node_forced_to_reprocess(&self, node_name: &str) -> bool {
        self.all_nodes || self.nodes.contains(node_name) || self.sub_recipes.contains_key(node_name)
    }

    pub fn is_empty(&self) -> bool {
        !self.all_nodes && self.nodes.is_empty() && self.sub_recipes.is_empty()
    }

    pub fn from_json(value: serde_json::Value) -> OrchestratorResult<Self> {
        serde_json::from_value(value)
            .map_err(|err| OrchestratorError::invalid_data("INVALID_FORCED_NODES", err.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForcedNodesJson {
    #[serde(default = "forced_nodes_version")]
    version: String,
    all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_recipes: Option<BTreeMap<String, ForcedNodesJson>>,
}

fn forced_nodes_version() -> String {
    FORCED_NODES_SCHEMA_VERSION.to_string()
}

impl TryFrom<ForcedNodesJson> for ForcedNodes {
    type Error = String;

    fn try_from(value: ForcedNodesJson) -> Result<Self, Self::Error> {
        if !SUPPORTED_VERSIONS.contains(&value.version.as_str()) {
            return Err(format!(
                "Invalid forced nodes version '{}', supported versions are {:?}",
                value.version, SUPPORTED_VERSIONS
            ));
        }

        let mut forced = ForcedNodes::new();
        if value.all {
            forced.set_all_nodes();
            return Ok(forced);
        }
        for node in value.nodes.unwrap_or_default() {
            forced.add_node(node);
        }
        for (name, sub) in value.sub_recipes.unwrap_or_default() {
            forced.add_subrecipe(name, ForcedNodes::try_from(sub)?);
        }
        Ok(forced)
    }
}

impl From<ForcedNodes> for ForcedNodesJson {
    fn from(value: ForcedNodes) -> Self {
        if value.all_nodes {
            return ForcedNodesJson {
                version: forced_nodes_version(),
                all: true,
                nodes: None,
                sub_recipes: None,
            };
        }
        ForcedNodesJson {
            version: forced_nodes_version(),
            all: false,
            nodes: Some(value.nodes.into_iter().collect()),
            sub_recipes: Some(
                value
                    .sub_recipes
                    .into_iter()
                    .map(|(name, sub)| (name, ForcedNodesJson::from(sub)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forced_queries() {
        let mut sub = ForcedNodes::new();
        sub.add_node("inner");
        let mut forced = ForcedNodes::new();
        forced.add_node("job_a");
        forced.add_subrecipe("recipe_b", sub.clone());

        assert!(forced.is_node_forced_to_reprocess("job_a"));
        assert!(forced.is_node_forced_to_reprocess("recipe_b"));
        assert!(!forced.is_node_forced_to_reprocess("job_c"));
        assert_eq!(forced.get_forced_nodes_for_subrecipe("recipe_b"), Some(sub));
        assert_eq!(forced.get_forced_nodes_for_subrecipe("job_a"), None);

        let all = ForcedNodes::all();
        assert!(all.is_node_forced_to_reprocess("anything"));
        assert_eq!(
            all.get_forced_nodes_for_subrecipe("anything"),
            Some(ForcedNodes::all())
        );
    }

    #[test]
    fn test_json_shape() {
        assert_eq!(
            ForcedNodes::all().to_json(),
            json!({"version": "7", "all": true})
        );

        let mut forced = ForcedNodes::new();
        forced.add_subrecipe("sub", ForcedNodes::all());
        assert_eq!(
            forced.to_json(),
            json!({
                "version": "7",
                "all": false,
                "nodes": ["sub"],
                "sub_recipes": {"sub": {"version": "7", "all": true}}
            })
        );
        assert_eq!(ForcedNodes::from_json(forced.to_json()).unwrap(), forced);
    }

    #[test]
    fn test_version_check() {
        assert!(ForcedNodes::from_json(json!({"version": "6", "all": false, "nodes": ["a"]})).is_ok());
        assert!(ForcedNodes::from_json(json!({"all": true})).is_ok());
        assert!(ForcedNodes::from_json(json!({"version": "5", "all": true})).is_err());
        assert!(ForcedNodes::from_json(json!({"nodes": ["a"]})).is_err());
    }
}
