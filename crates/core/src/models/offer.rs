//! 资源供给通道上流动的数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeResources;

/// 集群发来的一次资源供给
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub offer_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub resources: NodeResources,
    pub received: DateTime<Utc>,
}

/// 一个待启动的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub task_id: String,
    pub agent_id: String,
    pub name: String,
    pub resources: NodeResources,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "STAGING")]
    Staging,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "KILLED")]
    Killed,
    #[serde(rename = "LOST")]
    Lost,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }
}

/// 任务状态回报
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl TaskStatusUpdate {
    pub fn new(task_id: impl Into<String>, state: TaskState, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: None,
            state,
            timestamp,
            exit_code: None,
            reason: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// 资源通道推送给调度循环的事件
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Offers(Vec<ResourceOffer>),
    OfferRescinded { offer_id: String },
    StatusUpdate(TaskStatusUpdate),
    NodeLost { agent_id: String },
}
