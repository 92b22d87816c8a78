//! 调度器的内存状态，由 `ScaleScheduler` 放在一把锁后面

use std::collections::{BTreeMap, BTreeSet};

use orchestrator_domain::Node;
use orchestrator_worker::{ExecutionOutcome, RunningJobExecution};

use crate::messages::CommandMessage;

#[derive(Debug, Default)]
pub struct SchedulerContext {
    /// agent_id -> 节点
    nodes: BTreeMap<String, Node>,
    /// 节点 ID -> (执行 ID -> 执行)
    running: BTreeMap<i64, BTreeMap<i64, RunningJobExecution>>,
    /// 执行 ID -> 节点 ID
    exe_nodes: BTreeMap<i64, i64>,
    /// 需要重新确认状态的任务
    reconciliation: BTreeSet<String>,
    /// 写入存储失败、等待重试的执行结果
    unapplied: BTreeMap<i64, ExecutionOutcome>,
    /// 结果已写入但发布失败的后续消息
    unpublished: Vec<CommandMessage>,
    paused: bool,
}

impl SchedulerContext {
    pub fn new(paused: bool) -> Self {
        Self {
            paused,
            ..Self::default()
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn node(&self, agent_id: &str) -> Option<&Node> {
        self.nodes.get(agent_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.agent_id.clone(), node);
    }

    /// 移除节点及其上的全部执行
    pub fn remove_node(&mut self, agent_id: &str) -> Option<(Node, Vec<RunningJobExecution>)> {
        let node = self.nodes.remove(agent_id)?;
        let executions: Vec<RunningJobExecution> = self
            .running
            .remove(&node.id)
            .map(|executions| executions.into_values().collect())
            .unwrap_or_default();
        for exe in &executions {
            self.exe_nodes.remove(&exe.id);
        }
        Some((node, executions))
    }

    pub fn add_execution(&mut self, node_id: i64, exe: RunningJobExecution) {
        self.exe_nodes.insert(exe.id, node_id);
        self.running.entry(node_id).or_default().insert(exe.id, exe);
    }

    pub fn execution(&self, exe_id: i64) -> Option<&RunningJobExecution> {
        let node_id = self.exe_nodes.get(&exe_id)?;
        self.running.get(node_id)?.get(&exe_id)
    }

    pub fn execution_mut(&mut self, exe_id: i64) -> Option<&mut RunningJobExecution> {
        let node_id = self.exe_nodes.get(&exe_id)?;
        self.running.get_mut(node_id)?.get_mut(&exe_id)
    }

    pub fn remove_execution(&mut self, exe_id: i64) -> Option<RunningJobExecution> {
        let node_id = self.exe_nodes.remove(&exe_id)?;
        let executions = self.running.get_mut(&node_id)?;
        let exe = executions.remove(&exe_id);
        if executions.is_empty() {
            self.running.remove(&node_id);
        }
        exe
    }

    pub fn executions_on_node_mut(
        &mut self,
        node_id: i64,
    ) -> impl Iterator<Item = &mut RunningJobExecution> {
        self.running
            .get_mut(&node_id)
            .into_iter()
            .flat_map(|executions| executions.values_mut())
    }

    pub fn executions_mut(&mut self) -> impl Iterator<Item = &mut RunningJobExecution> {
        self.running
            .values_mut()
            .flat_map(|executions| executions.values_mut())
    }

    pub fn execution_ids(&self) -> Vec<i64> {
        self.exe_nodes.keys().copied().collect()
    }

    pub fn running_count(&self) -> usize {
        self.exe_nodes.len()
    }

    /// 移除已经结束的执行
    pub fn remove_finished(&mut self) -> Vec<RunningJobExecution> {
        let finished: Vec<i64> = self
            .running
            .values()
            .flat_map(|executions| executions.values())
            .filter(|exe| exe.is_finished())
            .map(|exe| exe.id)
            .collect();
        finished
            .into_iter()
            .filter_map(|exe_id| self.remove_execution(exe_id))
            .collect()
    }

    pub fn add_reconciliation(&mut self, task_id: impl Into<String>) {
        self.reconciliation.insert(task_id.into());
    }

    pub fn take_reconciliation(&mut self) -> Vec<String> {
        std::mem::take(&mut self.reconciliation).into_iter().collect()
    }

    pub fn add_unapplied(&mut self, exe_id: i64, outcome: ExecutionOutcome) {
        self.unapplied.insert(exe_id, outcome);
    }

    pub fn take_unapplied(&mut self) -> Vec<(i64, ExecutionOutcome)> {
        std::mem::take(&mut self.unapplied).into_iter().collect()
    }

    pub fn add_unpublished(&mut self, messages: Vec<CommandMessage>) {
        self.unpublished.extend(messages);
    }

    pub fn take_unpublished(&mut self) -> Vec<CommandMessage> {
        std::mem::take(&mut self.unpublished)
    }
}
