use async_trait::async_trait;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::Node;
use orchestrator_domain::store::NodeRepository;

use super::{next_id, InMemoryTransaction};

#[async_trait]
impl NodeRepository for InMemoryTransaction {
    async fn get_nodes(&mut self) -> OrchestratorResult<Vec<Node>> {
        Ok(self.working.nodes.values().cloned().collect())
    }

    async fn get_node_by_agent(&mut self, agent_id: &str) -> OrchestratorResult<Option<Node>> {
        Ok(self
            .working
            .nodes
            .values()
            .find(|node| node.agent_id == agent_id)
            .cloned())
    }

    async fn create_node(&mut self, mut node: Node) -> OrchestratorResult<Node> {
        let state = &mut self.working;
        node.id = next_id(&mut state.sequences.node);
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn update_node(&mut self, node: &Node) -> OrchestratorResult<()> {
        let row = self
            .working
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| OrchestratorError::store(format!("Node {} does not exist", node.id)))?;
        *row = node.clone();
        Ok(())
    }
}
