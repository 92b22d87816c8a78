//! 配方定义的 JSON 形态
//!
//! 解码时补齐缺省值（`acceptance` 默认为 true，`input`/`dependencies` 默认为空），
//! 再构建成经过结构校验的 [`RecipeDefinition`]。

use std::collections::BTreeMap;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use super::{InputConnection, NodeType, RecipeDefinition};
use crate::interface::Interface;

pub const DEFINITION_SCHEMA_VERSION: &str = "6";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyJson {
    pub name: String,
    #[serde(default = "default_acceptance")]
    pub acceptance: bool,
}

fn default_acceptance() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionJson {
    Recipe { input: String },
    Dependency { node: String, output: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "lowercase")]
pub enum NodeTypeJson {
    Job {
        job_type_name: String,
        job_type_version: String,
        job_type_revision: i32,
    },
    Recipe {
        recipe_type_name: String,
        recipe_type_revision: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJson {
    #[serde(default)]
    pub dependencies: Vec<DependencyJson>,
    #[serde(default)]
    pub input: BTreeMap<String, ConnectionJson>,
    pub node_type: NodeTypeJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeDefinitionJson {
    #[serde(default = "definition_version")]
    pub version: String,
    #[serde(default)]
    pub input: Interface,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeJson>,
}

fn definition_version() -> String {
    DEFINITION_SCHEMA_VERSION.to_string()
}

impl RecipeDefinitionJson {
    pub fn into_definition(self) -> OrchestratorResult<RecipeDefinition> {
        if self.version != DEFINITION_SCHEMA_VERSION {
            return Err(OrchestratorError::invalid_definition(
                "INVALID_VERSION",
                format!("Unsupported recipe definition version '{}'", self.version),
            ));
        }

        let mut definition = RecipeDefinition::new(self.input);

        // 先加入全部节点，再连边
        for (name, node) in &self.nodes {
            match &node.node_type {
                NodeTypeJson::Job {
                    job_type_name,
                    job_type_version,
                    job_type_revision,
                } => definition.add_job_node(
                    name,
                    job_type_name,
                    job_type_version,
                    *job_type_revision,
                )?,
                NodeTypeJson::Recipe {
                    recipe_type_name,
                    recipe_type_revision,
                } => definition.add_recipe_node(name, recipe_type_name, *recipe_type_revision)?,
            }
        }

        for (name, node) in &self.nodes {
            for dependency in &node.dependencies {
                definition.add_dependency(&dependency.name, name, dependency.acceptance)?;
            }
            for (input_name, connection) in &node.input {
                match connection {
                    ConnectionJson::Recipe { input } => {
                        definition.add_recipe_input_connection(name, input_name, input)?
                    }
                    ConnectionJson::Dependency { node, output } => {
                        definition.add_dependency_input_connection(name, input_name, node, output)?
                    }
                }
            }
        }

        definition.get_topological_order()?;
        Ok(definition)
    }
}

impl TryFrom<RecipeDefinitionJson> for RecipeDefinition {
    type Error = OrchestratorError;

    fn try_from(value: RecipeDefinitionJson) -> Result<Self, Self::Error> {
        value.into_definition()
    }
}

impl From<RecipeDefinition> for RecipeDefinitionJson {
    fn from(definition: RecipeDefinition) -> Self {
        let nodes = definition
            .nodes()
            .map(|node| {
                let node_type = match &node.node_type {
                    NodeType::Job {
                        job_type_name,
                        job_type_version,
                        revision_num,
                    } => NodeTypeJson::Job {
                        job_type_name: job_type_name.clone(),
                        job_type_version: job_type_version.clone(),
                        job_type_revision: *revision_num,
                    },
                    NodeType::Recipe {
                        recipe_type_name,
                        revision_num,
                    } => NodeTypeJson::Recipe {
                        recipe_type_name: recipe_type_name.clone(),
                        recipe_type_revision: *revision_num,
                    },
                };
                let dependencies = node
                    .parents
                    .iter()
                    .map(|(name, acceptance)| DependencyJson {
                        name: name.clone(),
                        acceptance: *acceptance,
                    })
                    .collect();
                let input = node
                    .connections
                    .iter()
                    .map(|(input_name, connection)| {
                        let json = match connection {
                            InputConnection::Recipe {
                                recipe_input_name, ..
                            } => ConnectionJson::Recipe {
                                input: recipe_input_name.clone(),
                            },
                            InputConnection::Dependency {
                                node_name,
                                output_name,
                                ..
                            } => ConnectionJson::Dependency {
                                node: node_name.clone(),
                                output: output_name.clone(),
                            },
                        };
                        (input_name.clone(), json)
                    })
                    .collect();
                (
                    node.name.clone(),
                    NodeJson {
                        dependencies,
                        input,
                        node_type,
                    },
                )
            })
            .collect();

        RecipeDefinitionJson {
            version: definition_version(),
            input: definition.input_interface,
            nodes,
        }
    }
}

impl RecipeDefinition {
    pub fn from_json(value: serde_json::Value) -> OrchestratorResult<Self> {
        let json: RecipeDefinitionJson = serde_json::from_value(value).map_err(|err| {
            OrchestratorError::invalid_definition("INVALID_DEFINITION", err.to_string())
        })?;
        json.into_definition()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(RecipeDefinitionJson::from(self.clone()))
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "version": "6",
            "input": {"files": [{"name": "INPUT_FILE", "media_types": ["image/tiff"]}]},
            "nodes": {
                "ingest": {
                    "input": {"IMAGE": {"type": "recipe", "input": "INPUT_FILE"}},
                    "node_type": {"node_type": "job", "job_type_name": "ingest", "job_type_version": "1.0.0", "job_type_revision": 2}
                },
                "detect": {
                    "dependencies": [{"name": "ingest"}],
                    "input": {"IMAGE": {"type": "dependency", "node": "ingest", "output": "OUTPUT_IMAGE"}},
                    "node_type": {"node_type": "job", "job_type_name": "detect", "job_type_version": "2.1.0", "job_type_revision": 1}
                },
                "report": {
                    "dependencies": [{"name": "detect", "acceptance": false}],
                    "node_type": {"node_type": "recipe", "recipe_type_name": "reporting", "recipe_type_revision": 4}
                }
            }
        })
    }

    #[test]
    fn test_decode_with_defaults() {
        let definition = RecipeDefinition::from_json(sample()).unwrap();
        assert_eq!(definition.len(), 3);
        let detect = definition.node("detect").unwrap();
        assert_eq!(detect.parents.get("ingest"), Some(&true));
        let report = definition.node("report").unwrap();
        assert_eq!(report.parents.get("detect"), Some(&false));
        assert!(report.connections.is_empty());
        assert!(definition.input_interface.get("INPUT_FILE").unwrap().required);
        assert_eq!(
            definition.get_topological_order().unwrap(),
            vec!["ingest", "detect", "report"]
        );
    }

    #[test]
    fn test_json_round_trip() {
        let definition = RecipeDefinition::from_json(sample()).unwrap();
        let encoded = definition.to_json();
        assert_eq!(encoded["version"], "6");
        let decoded: RecipeDefinition = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, definition);
    }

    #[test]
    fn test_decode_rejects_invalid_graph() {
        let mut cyclic = sample();
        cyclic["nodes"]["ingest"]["dependencies"] = json!([{"name": "report"}]);
        assert!(RecipeDefinition::from_json(cyclic).is_err());

        let mut unknown = sample();
        unknown["nodes"]["detect"]["dependencies"] = json!([{"name": "nope"}]);
        assert!(RecipeDefinition::from_json(unknown).is_err());

        let mut wrong_version = sample();
        wrong_version["version"] = json!("1");
        assert!(RecipeDefinition::from_json(wrong_version).is_err());
    }
}
