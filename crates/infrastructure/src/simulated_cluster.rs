//! 本地模拟集群
//!
//! 按间隔为每个代理节点发出空闲资源的供给；启动的任务依次回报 RUNNING 与 FINISHED，
//! 杀掉的任务回报 KILLED，对账请求重放最后一次状态，未知任务回报 LOST。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{
    ClusterConfig, NodeResources, OrchestratorError, OrchestratorResult, ResourceOffer,
    ResourceTransport, SchedulerEvent, TaskLaunch, TaskState, TaskStatusUpdate,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Agent {
    hostname: String,
    total: NodeResources,
    used: NodeResources,
    outstanding_offer: Option<String>,
    is_lost: bool,
}

impl Agent {
    fn free(&self) -> NodeResources {
        let mut free = self.total;
        free.subtract(&self.used);
        free
    }
}

#[derive(Debug, Clone)]
struct SimulatedTask {
    agent_id: String,
    resources: NodeResources,
    state: TaskState,
}

#[derive(Debug, Default)]
struct ClusterState {
    agents: BTreeMap<String, Agent>,
    /// offer_id -> agent_id
    offers: HashMap<String, String>,
    tasks: HashMap<String, SimulatedTask>,
}

impl ClusterState {
    /// 任务进入终止状态并归还资源；任务已终止时返回 false
    fn finish_task(&mut self, task_id: &str, state: TaskState) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.state.is_terminal() {
            return false;
        }
        task.state = state;
        let resources = task.resources;
        if let Some(agent) = self.agents.get_mut(&task.agent_id) {
            agent.used.subtract(&resources);
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedCluster {
    config: ClusterConfig,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    state: Arc<Mutex<ClusterState>>,
}

impl SimulatedCluster {
    /// 代理节点 ID 形如 `agent-{n}`，顺序与配置一致
    pub fn new(config: ClusterConfig, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        let agents = config
            .agents
            .iter()
            .enumerate()
            .map(|(index, agent)| {
                (
                    format!("agent-{}", index + 1),
                    Agent {
                        hostname: agent.hostname.clone(),
                        total: NodeResources::new(agent.cpus, agent.mem, agent.disk),
                        used: NodeResources::default(),
                        outstanding_offer: None,
                        is_lost: false,
                    },
                )
            })
            .collect();
        Self {
            config,
            events,
            state: Arc::new(Mutex::new(ClusterState {
                agents,
                ..ClusterState::default()
            })),
        }
    }

    /// 为没有未决供给的节点发出供给，返回发出的供给数
    pub async fn send_offers(&self) -> usize {
        let offers: Vec<ResourceOffer> = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let mut offers = Vec::new();
            for (agent_id, agent) in state.agents.iter_mut() {
                if agent.is_lost || agent.outstanding_offer.is_some() {
                    continue;
                }
                let free = agent.free();
                if free.is_empty() {
                    continue;
                }
                let offer_id = Uuid::new_v4().to_string();
                agent.outstanding_offer = Some(offer_id.clone());
                state.offers.insert(offer_id.clone(), agent_id.clone());
                offers.push(ResourceOffer {
                    offer_id,
                    agent_id: agent_id.clone(),
                    hostname: agent.hostname.clone(),
                    resources: free,
                    received: Utc::now(),
                });
            }
            offers
        };
        let count = offers.len();
        if count > 0 {
            debug!(count, "Sending resource offers");
            self.emit(SchedulerEvent::Offers(offers));
        }
        count
    }

    /// 模拟节点丢失：撤销供给，节点上的任务全部 LOST
    pub async fn lose_agent(&self, agent_id: &str) {
        let lost_tasks: Vec<String> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(agent) = state.agents.get_mut(agent_id) else {
                return;
            };
            agent.is_lost = true;
            agent.outstanding_offer = None;
            state.offers.retain(|_, owner| owner.as_str() != agent_id);
            let task_ids: Vec<String> = state
                .tasks
                .iter()
                .filter(|(_, task)| task.agent_id == agent_id && !task.state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in &task_ids {
                state.finish_task(task_id, TaskState::Lost);
            }
            task_ids
        };
        warn!(agent.id = agent_id, tasks = lost_tasks.len(), "Simulated agent lost");
        self.emit(SchedulerEvent::NodeLost {
            agent_id: agent_id.to_string(),
        });
        for task_id in lost_tasks {
            self.emit_update(TaskStatusUpdate::new(task_id, TaskState::Lost, Utc::now()).with_agent(agent_id));
        }
    }

    /// 按配置间隔发出供给，直到收到关闭信号
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.offer_interval_ms));
        info!(agents = self.config.agents.len(), "Simulated cluster started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.send_offers().await;
                }
                _ = shutdown.recv() => {
                    info!("Simulated cluster stopped");
                    break;
                }
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.events.send(event).is_err() {
            debug!("Scheduler event channel closed");
        }
    }

    fn emit_update(&self, update: TaskStatusUpdate) {
        self.emit(SchedulerEvent::StatusUpdate(update));
    }

    async fn release_offers(&self, offer_ids: &[String]) {
        let mut state = self.state.lock().await;
        for offer_id in offer_ids {
            if let Some(agent_id) = state.offers.remove(offer_id) {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.outstanding_offer = None;
                }
            }
        }
    }
}

#[async_trait]
impl ResourceTransport for SimulatedCluster {
    async fn launch_tasks(&self, offer_ids: &[String], tasks: Vec<TaskLaunch>) -> OrchestratorResult<()> {
        {
            let state = self.state.lock().await;
            if let Some(unknown) = offer_ids.iter().find(|id| !state.offers.contains_key(*id)) {
                return Err(OrchestratorError::Transport(format!("Unknown offer {unknown}")));
            }
        }
        self.release_offers(offer_ids).await;

        for launch in tasks {
            let accepted = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                match state.agents.get_mut(&launch.agent_id) {
                    Some(agent) if !agent.is_lost => {
                        agent.used.add(&launch.resources);
                        state.tasks.insert(
                            launch.task_id.clone(),
                            SimulatedTask {
                                agent_id: launch.agent_id.clone(),
                                resources: launch.resources,
                                state: TaskState::Staging,
                            },
                        );
                        true
                    }
                    _ => false,
                }
            };
            if !accepted {
                self.emit_update(
                    TaskStatusUpdate::new(&launch.task_id, TaskState::Lost, Utc::now())
                        .with_agent(&launch.agent_id)
                        .with_reason("agent unavailable"),
                );
                continue;
            }

            debug!(task.id = %launch.task_id, agent.id = %launch.agent_id, "Launching simulated task");
            let cluster = self.clone();
            let duration = Duration::from_millis(self.config.task_duration_ms);
            tokio::spawn(async move {
                {
                    let mut state = cluster.state.lock().await;
                    match state.tasks.get_mut(&launch.task_id) {
                        Some(task) if task.state == TaskState::Staging => task.state = TaskState::Running,
                        _ => return,
                    }
                    cluster.emit_update(
                        TaskStatusUpdate::new(&launch.task_id, TaskState::Running, Utc::now())
                            .with_agent(&launch.agent_id),
                    );
                }

                tokio::time::sleep(duration).await;
                let mut state = cluster.state.lock().await;
                if state.finish_task(&launch.task_id, TaskState::Finished) {
                    cluster.emit_update(
                        TaskStatusUpdate::new(&launch.task_id, TaskState::Finished, Utc::now())
                            .with_agent(&launch.agent_id)
                            .with_exit_code(0),
                    );
                }
            });
        }
        Ok(())
    }

    async fn decline_offers(&self, offer_ids: &[String]) -> OrchestratorResult<()> {
        self.release_offers(offer_ids).await;
        Ok(())
    }

    async fn kill_task(&self, task_id: &str, agent_id: &str) -> OrchestratorResult<()> {
        // 状态变化与回报在同一临界区内，保证回报顺序
        let mut state = self.state.lock().await;
        let reported = if state.finish_task(task_id, TaskState::Killed) {
            Some(TaskState::Killed)
        } else if state.tasks.contains_key(task_id) {
            None
        } else {
            Some(TaskState::Lost)
        };
        if let Some(reported) = reported {
            info!(task.id = task_id, agent.id = agent_id, state = ?reported, "Simulated task kill");
            self.emit_update(TaskStatusUpdate::new(task_id, reported, Utc::now()).with_agent(agent_id));
        }
        Ok(())
    }

    async fn reconcile_tasks(&self, task_ids: &[String]) -> OrchestratorResult<()> {
        let updates: Vec<TaskStatusUpdate> = {
            let state = self.state.lock().await;
            task_ids
                .iter()
                .map(|task_id| match state.tasks.get(task_id) {
                    Some(task) => TaskStatusUpdate::new(task_id, task.state, Utc::now())
                        .with_agent(&task.agent_id),
                    None => TaskStatusUpdate::new(task_id, TaskState::Lost, Utc::now())
                        .with_reason("reconciliation: unknown task"),
                })
                .collect()
        };
        for update in updates {
            self.emit_update(update);
        }
        Ok(())
    }
}
