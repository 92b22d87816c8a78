//! 配方定义：输入接口 + 作业/子配方节点组成的有向无环图

pub mod json;
pub mod node;

use std::collections::{BTreeMap, BTreeSet};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::interface::{Data, Interface, ValidationWarning};

pub use json::RecipeDefinitionJson;
pub use node::{InputConnection, NodeDefinition, NodeType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecipeDefinitionJson", into = "RecipeDefinitionJson")]
pub struct RecipeDefinition {
    pub input_interface: Interface,
    graph: BTreeMap<String, NodeDefinition>,
}

impl RecipeDefinition {
    pub fn new(input_interface: Interface) -> Self {
        Self {
            input_interface,
            graph: BTreeMap::new(),
        }
    }

    pub fn add_job_node(
        &mut self,
        name: &str,
        job_type_name: &str,
        job_type_version: &str,
        revision_num: i32,
    ) -> OrchestratorResult<()> {
        self.add_node(NodeDefinition::new(
            name,
            NodeType::Job {
                job_type_name: job_type_name.to_string(),
                job_type_version: job_type_version.to_string(),
                revision_num,
            },
        ))
    }

    pub fn add_recipe_node(
        &mut self,
        name: &str,
        recipe_type_name: &str,
        revision_num: i32,
    ) -> OrchestratorResult<()> {
        self.add_node(NodeDefinition::new(
            name,
            NodeType::Recipe {
                recipe_type_name: recipe_type_name.to_string(),
                revision_num,
            },
        ))
    }

    fn add_node(&mut self, node: NodeDefinition) -> OrchestratorResult<()> {
        if self.graph.contains_key(&node.name) {
            return Err(OrchestratorError::invalid_definition(
                "DUPLICATE_NODE",
                format!("Node '{}' is already defined", node.name),
            ));
        }
        self.graph.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn add_dependency(
        &mut self,
        parent_name: &str,
        child_name: &str,
        acceptance: bool,
    ) -> OrchestratorResult<()> {
        self.require_node(child_name)?;
        self.require_node(parent_name)?;

        if let Some(child) = self.graph.get_mut(child_name) {
            child.parents.insert(parent_name.to_string(), acceptance);
        }
        if let Some(parent) = self.graph.get_mut(parent_name) {
            parent.children.insert(child_name.to_string());
        }
        Ok(())
    }

    pub fn add_recipe_input_connection(
        &mut self,
        node_name: &str,
        node_input_name: &str,
        recipe_input_name: &str,
    ) -> OrchestratorResult<()> {
        if !self.input_interface.parameters.contains_key(recipe_input_name) {
            return Err(OrchestratorError::invalid_definition(
                "UNKNOWN_INPUT",
                format!("Recipe input '{recipe_input_name}' is not defined"),
            ));
        }
        self.add_connection(
            node_name,
            InputConnection::Recipe {
                input_name: node_input_name.to_string(),
                recipe_input_name: recipe_input_name.to_string(),
            },
        )
    }

    /// 子配方节点没有可连接的输出
    pub fn add_dependency_input_connection(
        &mut self,
        node_name: &str,
        node_input_name: &str,
        dependency_name: &str,
        dependency_output_name: &str,
    ) -> OrchestratorResult<()> {
        let dependency = self.require_node(dependency_name)?;
        if dependency.is_recipe() {
            return Err(OrchestratorError::invalid_definition(
                "CONNECTION_INVALID_NODE",
                format!("Node '{node_name}' cannot have a connection to a recipe node"),
            ));
        }
        self.add_connection(
            node_name,
            InputConnection::Dependency {
                input_name: node_input_name.to_string(),
                node_name: dependency_name.to_string(),
                output_name: dependency_output_name.to_string(),
            },
        )
    }

    fn add_connection(
        &mut self,
        node_name: &str,
        connection: InputConnection,
    ) -> OrchestratorResult<()> {
        let node = self.graph.get_mut(node_name).ok_or_else(|| {
            OrchestratorError::invalid_definition(
                "UNKNOWN_NODE",
                format!("Node '{node_name}' is not defined"),
            )
        })?;
        let input_name = connection.input_name().to_string();
        if node.connections.contains_key(&input_name) {
            return Err(OrchestratorError::invalid_definition(
                "NODE_INTERFACE",
                format!(
                    "Node '{node_name}' interface error: Input '{input_name}' has more than one parameter connected to it"
                ),
            ));
        }
        node.connections.insert(input_name, connection);
        Ok(())
    }

    fn require_node(&self, name: &str) -> OrchestratorResult<&NodeDefinition> {
        self.graph.get(name).ok_or_else(|| {
            OrchestratorError::invalid_definition(
                "UNKNOWN_NODE",
                format!("Node '{name}' is not defined"),
            )
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.graph.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.graph.values()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn get_input_keys(&self) -> Vec<String> {
        self.input_interface.parameters.keys().cloned().collect()
    }

    /// (name, version) 形式的作业类型键
    pub fn get_job_type_keys(&self) -> BTreeSet<(String, String)> {
        self.graph
            .values()
            .filter_map(|node| match &node.node_type {
                NodeType::Job {
                    job_type_name,
                    job_type_version,
                    ..
                } => Some((job_type_name.clone(), job_type_version.clone())),
                NodeType::Recipe { .. } => None,
            })
            .collect()
    }

    pub fn get_recipe_type_names(&self) -> BTreeSet<String> {
        self.graph
            .values()
            .filter_map(|node| match &node.node_type {
                NodeType::Recipe {
                    recipe_type_name, ..
                } => Some(recipe_type_name.clone()),
                NodeType::Job { .. } => None,
            })
            .collect()
    }

    /// 按依赖顺序返回节点名，父节点总在子节点之前
    ///
    /// 深度优先遍历，按名称排序保证结果确定；存在环时返回 CIRCULAR_DEPENDENCY。
    pub fn get_topological_order(&self) -> OrchestratorResult<Vec<String>> {
        let mut results: Vec<String> = Vec::with_capacity(self.graph.len());
        let mut perm: BTreeSet<&str> = BTreeSet::new();
        let mut temp: BTreeSet<&str> = BTreeSet::new();

        for name in self.graph.keys().rev() {
            self.topological_visit(name, &mut results, &mut perm, &mut temp)?;
        }

        results.reverse();
        Ok(results)
    }

    fn topological_visit<'a>(
        &'a self,
        name: &'a str,
        results: &mut Vec<String>,
        perm: &mut BTreeSet<&'a str>,
        temp: &mut BTreeSet<&'a str>,
    ) -> OrchestratorResult<()> {
        if perm.contains(name) {
            return Ok(());
        }
        if temp.contains(name) {
            return Err(OrchestratorError::invalid_definition(
                "CIRCULAR_DEPENDENCY",
                format!("Recipe node '{name}' has a circular dependency on itself"),
            ));
        }
        let node = self.require_node(name)?;
        temp.insert(name);
        for child in node.children.iter().rev() {
            self.topological_visit(child, results, perm, temp)?;
        }
        temp.remove(name);
        perm.insert(name);
        results.push(name.to_string());
        Ok(())
    }

    /// 所有祖先节点名
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut all = BTreeSet::new();
        let mut stack: Vec<&str> = match self.graph.get(name) {
            Some(node) => node.parents.keys().map(String::as_str).collect(),
            None => return all,
        };
        while let Some(current) = stack.pop() {
            if all.insert(current.to_string()) {
                if let Some(node) = self.graph.get(current) {
                    stack.extend(node.parents.keys().map(String::as_str));
                }
            }
        }
        all
    }

    /// 由配方输入与上游节点输出生成节点输入
    pub fn generate_node_input_data(
        &self,
        node_name: &str,
        recipe_input: &Data,
        node_outputs: &BTreeMap<String, Data>,
    ) -> OrchestratorResult<Data> {
        let node = self.require_node(node_name)?;
        let mut input = Data::new();
        for connection in node.connections.values() {
            match connection {
                InputConnection::Recipe {
                    input_name,
                    recipe_input_name,
                } => {
                    input.add_value_from_output_data(input_name, recipe_input_name, recipe_input)?
                }
                InputConnection::Dependency {
                    input_name,
                    node_name: dependency,
                    output_name,
                } => {
                    let output = node_outputs.get(dependency).ok_or_else(|| {
                        OrchestratorError::invalid_data(
                            "MISSING_VALUE",
                            format!("Node '{dependency}' has no output"),
                        )
                    })?;
                    input.add_value_from_output_data(input_name, output_name, output)?
                }
            }
        }
        Ok(input)
    }

    /// 校验定义
    ///
    /// `node_input_interfaces`/`node_output_interfaces` 提供各节点（作业类型或子配方）的接口，
    /// 缺失的节点只做结构校验。
    pub fn validate(
        &self,
        node_input_interfaces: &BTreeMap<String, Interface>,
        node_output_interfaces: &BTreeMap<String, Interface>,
    ) -> OrchestratorResult<Vec<ValidationWarning>> {
        let mut warnings = self.input_interface.validate().map_err(|err| {
            OrchestratorError::invalid_definition("INPUT_INTERFACE", err.to_string())
        })?;

        for name in self.get_topological_order()? {
            let node = self.require_node(&name)?;
            let all_dependencies = self.ancestors(&name);
            let mut connecting = Interface::new();

            for connection in node.connections.values() {
                let result = match connection {
                    InputConnection::Recipe {
                        input_name,
                        recipe_input_name,
                    } => connecting.add_parameter_from_output_interface(
                        input_name,
                        recipe_input_name,
                        &self.input_interface,
                    ),
                    InputConnection::Dependency {
                        input_name,
                        node_name,
                        output_name,
                    } => {
                        if !all_dependencies.contains(node_name) {
                            return Err(OrchestratorError::invalid_definition(
                                "NODE_INTERFACE",
                                format!(
                                    "Node '{name}' interface error: Cannot get output '{output_name}' without dependency on node '{node_name}'"
                                ),
                            ));
                        }
                        match node_output_interfaces.get(node_name) {
                            Some(outputs) => connecting.add_parameter_from_output_interface(
                                input_name,
                                output_name,
                                outputs,
                            ),
                            None => Ok(()),
                        }
                    }
                };
                result.map_err(|err| {
                    OrchestratorError::invalid_definition(
                        "NODE_INTERFACE",
                        format!("Node '{name}' interface error: {err}"),
                    )
                })?;
            }

            if let Some(inputs) = node_input_interfaces.get(&name) {
                let connection_warnings =
                    inputs.validate_connection(&connecting).map_err(|err| {
                        OrchestratorError::invalid_definition(
                            "NODE_INTERFACE",
                            format!("Node '{name}' interface error: {err}"),
                        )
                    })?;
                warnings.extend(connection_warnings);
            }
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Parameter;

    fn diamond() -> RecipeDefinition {
        let input = Interface::new().with_parameter(Parameter::file("INPUT", true, false));
        let mut definition = RecipeDefinition::new(input);
        definition.add_job_node("a", "job-a", "1.0", 1).unwrap();
        definition.add_job_node("b", "job-b", "1.0", 1).unwrap();
        definition.add_recipe_node("c", "sub", 2).unwrap();
        definition.add_job_node("d", "job-d", "1.0", 1).unwrap();
        definition.add_dependency("a", "b", true).unwrap();
        definition.add_dependency("a", "c", true).unwrap();
        definition.add_dependency("b", "d", true).unwrap();
        definition.add_dependency("c", "d", true).unwrap();
        definition
            .add_recipe_input_connection("a", "IN", "INPUT")
            .unwrap();
        definition
            .add_dependency_input_connection("d", "IN", "b", "OUT")
            .unwrap();
        definition
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let definition = diamond();
        let order = definition.get_topological_order().unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(position("a"), 0);
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
        assert_eq!(order, definition.get_topological_order().unwrap());
    }

    #[test]
    fn test_circular_dependency_rejected() {
        let mut definition = diamond();
        definition.add_dependency("d", "a", true).unwrap();
        let err = definition.get_topological_order().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidDefinition { ref code, .. } if code == "CIRCULAR_DEPENDENCY"
        ));
    }

    #[test]
    fn test_invalid_construction() {
        let mut definition = diamond();
        assert!(definition.add_job_node("a", "x", "1", 1).is_err());
        assert!(definition.add_dependency("missing", "a", true).is_err());
        assert!(definition
            .add_dependency_input_connection("d", "OTHER", "c", "OUT")
            .is_err());
        assert!(definition
            .add_recipe_input_connection("b", "IN", "NOT_AN_INPUT")
            .is_err());
        assert!(definition
            .add_dependency_input_connection("d", "IN", "a", "OUT")
            .is_err());
    }

    #[test]
    fn test_validate_requires_ancestor_for_connection() {
        let mut definition = diamond();
        definition
            .add_dependency_input_connection("c", "IN", "b", "OUT")
            .unwrap();
        let err = definition
            .validate(&BTreeMap::new(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.code(), "NODE_INTERFACE");
    }

    #[test]
    fn test_generate_node_input_data() {
        let definition = diamond();
        let recipe_input = Data::new().with_files("INPUT", vec![42]);
        let a_input = definition
            .generate_node_input_data("a", &recipe_input, &BTreeMap::new())
            .unwrap();
        assert_eq!(a_input, Data::new().with_files("IN", vec![42]));

        let mut outputs = BTreeMap::new();
        outputs.insert("b".to_string(), Data::new().with_files("OUT", vec![7, 8]));
        let d_input = definition
            .generate_node_input_data("d", &recipe_input, &outputs)
            .unwrap();
        assert_eq!(d_input, Data::new().with_files("IN", vec![7, 8]));

        assert!(definition
            .generate_node_input_data("d", &recipe_input, &BTreeMap::new())
            .is_err());
    }

    #[test]
    fn test_keys() {
        let definition = diamond();
        assert_eq!(definition.get_input_keys(), vec!["INPUT".to_string()]);
        assert_eq!(definition.get_job_type_keys().len(), 3);
        assert!(definition.get_recipe_type_names().contains("sub"));
        assert_eq!(
            definition.ancestors("d"),
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }
}
