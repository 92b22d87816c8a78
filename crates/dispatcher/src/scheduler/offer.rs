//! 一个节点在一轮中收到的供给及已经装入的任务

use orchestrator_core::{NodeResources, ResourceOffer, TaskLaunch};
use orchestrator_domain::Node;

#[derive(Debug, Clone)]
pub struct ScaleOffer {
    pub node: Node,
    offer_ids: Vec<String>,
    available: NodeResources,
    tasks: Vec<TaskLaunch>,
    new_executions: usize,
}

impl ScaleOffer {
    /// 同一节点的多个供给合并为一个
    pub fn new(node: Node, offers: &[ResourceOffer]) -> Self {
        let mut available = NodeResources::default();
        for offer in offers {
            available.add(&offer.resources);
        }
        Self {
            node,
            offer_ids: offers.iter().map(|offer| offer.offer_id.clone()).collect(),
            available,
            tasks: Vec::new(),
            new_executions: 0,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.node.agent_id
    }

    pub fn offer_ids(&self) -> &[String] {
        &self.offer_ids
    }

    pub fn remaining(&self) -> NodeResources {
        self.available
    }

    pub fn new_executions(&self) -> usize {
        self.new_executions
    }

    /// 资源足够时扣减并返回 true
    pub fn reserve(&mut self, required: &NodeResources) -> bool {
        if !self.available.is_sufficient_to_meet(required) {
            return false;
        }
        self.available.subtract(required);
        true
    }

    pub fn reserve_new_execution(&mut self, required: &NodeResources) -> bool {
        if self.reserve(required) {
            self.new_executions += 1;
            return true;
        }
        false
    }

    pub fn add_task(&mut self, task: TaskLaunch) {
        self.tasks.push(task);
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn take_tasks(&mut self) -> Vec<TaskLaunch> {
        std::mem::take(&mut self.tasks)
    }
}
