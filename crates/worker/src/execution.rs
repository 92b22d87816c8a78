//! 正在运行的作业执行
//!
//! 任务按 pull -> pre -> main -> post 顺序逐个启动。执行状态在失败、超时、
//! 节点丢失或取消时立即确定，但只有当前任务的终止回报到达后执行才算结束。

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use orchestrator_core::{NodeResources, TaskLaunch, TaskState, TaskStatusUpdate, TaskTimeoutConfig};
use orchestrator_domain::entities::{JobError, JobExecution, JobInterface, JobType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::task::{ExecutionTask, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

/// 一次状态变化的结果，调度器据此更新存储
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { when: DateTime<Utc> },
    Failed { when: DateTime<Utc>, error: JobError },
}

#[derive(Debug, Clone)]
pub struct RunningJobExecution {
    pub id: i64,
    pub job_id: i64,
    pub job_type_id: i64,
    pub exe_num: i32,
    pub agent_id: String,
    pub node_id: Option<i64>,
    pub priority: i32,
    pub is_system: bool,
    interface: JobInterface,

    tasks: Vec<ExecutionTask>,
    current: Option<usize>,
    remaining: VecDeque<usize>,

    status: ExecutionStatus,
    error: Option<JobError>,
    finished: Option<DateTime<Utc>>,
    last_task_finished: Option<DateTime<Utc>>,
}

impl RunningJobExecution {
    /// 系统作业只有 main 任务
    pub fn new(
        agent_id: impl Into<String>,
        job_exe: &JobExecution,
        job_type: &JobType,
        timeouts: &TaskTimeoutConfig,
        priority: i32,
    ) -> Self {
        let agent_id = agent_id.into();
        let resources = job_exe.resources.as_node_resources();
        let kinds: &[TaskKind] = if job_type.is_system {
            &[TaskKind::Main]
        } else {
            &[TaskKind::Pull, TaskKind::Pre, TaskKind::Main, TaskKind::Post]
        };

        let tasks: Vec<ExecutionTask> = kinds
            .iter()
            .map(|kind| {
                let (running_timeout, command, task_resources) = match kind {
                    TaskKind::Pull => (
                        Some(Duration::seconds(timeouts.pull_seconds)),
                        Some(format!("pull {}:{}", job_type.name, job_type.version)),
                        NodeResources::new(resources.cpus, resources.mem, 0.0),
                    ),
                    TaskKind::Pre => (
                        Some(Duration::seconds(timeouts.pre_seconds)),
                        Some(format!("pre-steps {}", job_exe.id)),
                        resources,
                    ),
                    TaskKind::Main => {
                        let timeout = if job_type.is_long_running {
                            None
                        } else if job_type.is_system {
                            Some(Duration::seconds(timeouts.system_seconds))
                        } else {
                            Some(Duration::seconds(job_type.timeout_seconds))
                        };
                        (timeout, Some(job_type.interface.command.clone()), resources)
                    }
                    TaskKind::Post => (
                        Some(Duration::seconds(timeouts.post_seconds)),
                        Some(format!("post-steps {}", job_exe.id)),
                        resources,
                    ),
                };
                ExecutionTask::new(
                    *kind,
                    job_exe.id,
                    agent_id.clone(),
                    format!("{} {} ({})", job_type.name, job_type.version, kind),
                    task_resources,
                    command,
                    job_type.is_system,
                    running_timeout,
                )
            })
            .collect();

        Self {
            id: job_exe.id,
            job_id: job_exe.job_id,
            job_type_id: job_exe.job_type_id,
            exe_num: job_exe.exe_num,
            agent_id,
            node_id: job_exe.node_id,
            priority,
            is_system: job_type.is_system,
            interface: job_type.interface.clone(),
            remaining: (0..tasks.len()).collect(),
            tasks,
            current: None,
            status: ExecutionStatus::Running,
            error: None,
            finished: None,
            last_task_finished: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.finished
    }

    pub fn current_task(&self) -> Option<&ExecutionTask> {
        self.current.and_then(|index| self.tasks.get(index))
    }

    pub fn tasks(&self) -> &[ExecutionTask] {
        &self.tasks
    }

    /// 没有当前任务也没有剩余任务
    pub fn is_finished(&self) -> bool {
        self.current.is_none() && self.remaining.is_empty()
    }

    pub fn is_next_task_ready(&self) -> bool {
        self.current.is_none() && !self.remaining.is_empty()
    }

    pub fn next_task(&self) -> Option<&ExecutionTask> {
        self.remaining.front().and_then(|index| self.tasks.get(*index))
    }

    pub fn next_task_resources(&self) -> Option<NodeResources> {
        self.next_task().map(|task| task.resources)
    }

    /// 启动下一个任务；已有当前任务或没有剩余任务时返回 None
    pub fn start_next_task(&mut self, when: DateTime<Utc>) -> Option<TaskLaunch> {
        if self.current.is_some() {
            return None;
        }
        let index = self.remaining.pop_front()?;
        self.current = Some(index);
        let task = self.tasks.get_mut(index)?;
        debug!(job_exe.id = self.id, task.id = %task.id(), "Starting task");
        Some(task.launch(when))
    }

    /// 取消：剩余任务清空，当前任务需要杀掉
    pub fn execution_canceled(&mut self, when: DateTime<Utc>) {
        if let Some(task) = self.current_task_mut() {
            task.force_kill();
        }
        self.set_final_status(ExecutionStatus::Canceled, when, None);
    }

    /// 节点丢失：立即失败，当前任务等待对账
    pub fn execution_lost(&mut self, when: DateTime<Utc>) -> Option<ExecutionOutcome> {
        if let Some(task) = self.current_task_mut() {
            task.force_reconciliation();
        }
        self.set_final_status(ExecutionStatus::Failed, when, Some(JobError::node_lost()))
    }

    /// 超时：立即失败，执行要等当前任务被杀掉后才结束
    pub fn execution_timed_out(&mut self, when: DateTime<Utc>) -> Option<ExecutionOutcome> {
        let error = match self.current_task() {
            Some(task) => task.kind.timeout_error(self.is_system),
            None => JobError::timeout(),
        };
        self.set_final_status(ExecutionStatus::Failed, when, Some(error))
    }

    /// 检查当前任务是否超时，超时则使执行失败
    pub fn check_timeout(&mut self, when: DateTime<Utc>) -> Option<ExecutionOutcome> {
        let timed_out = self
            .current_task_mut()
            .is_some_and(|task| task.check_timeout(when));
        if timed_out {
            warn!(job_exe.id = self.id, "Job execution timed out");
            return self.execution_timed_out(when);
        }
        None
    }

    /// 需要杀掉的当前任务 (task_id, agent_id)
    pub fn task_to_kill(&self) -> Option<(String, String)> {
        self.current_task()
            .filter(|task| task.needs_killed())
            .map(|task| (task.id().to_string(), task.agent_id.clone()))
    }

    pub fn needs_reconciliation(&self, when: DateTime<Utc>) -> Option<String> {
        self.current_task()
            .filter(|task| task.needs_reconciliation(when))
            .map(|task| task.id().to_string())
    }

    /// 处理任务状态回报，返回本次产生的最终状态
    pub fn task_update(&mut self, update: &TaskStatusUpdate) -> Option<ExecutionOutcome> {
        let index = self.current?;
        let task = self.tasks.get_mut(index)?;
        if task.id() != update.task_id {
            return None;
        }
        let had_started = task.has_started();
        task.update(update);

        match update.state {
            TaskState::Staging | TaskState::Running => None,
            TaskState::Finished => {
                self.current = None;
                self.last_task_finished = Some(update.timestamp);
                if self.remaining.is_empty() {
                    self.set_final_status(ExecutionStatus::Completed, update.timestamp, None)
                } else {
                    None
                }
            }
            TaskState::Failed | TaskState::Killed => {
                let error = self
                    .current_task()
                    .and_then(|task| task.determine_error(update, &self.interface))
                    .unwrap_or_else(JobError::unknown);
                self.current = None;
                self.last_task_finished = Some(update.timestamp);
                self.set_final_status(ExecutionStatus::Failed, update.timestamp, Some(error))
            }
            TaskState::Lost => self.task_lost(index, had_started, update.timestamp),
        }
    }

    /// 启动前丢失的任务以新 ID 重新排到最前；已开始运行的任务丢失则执行失败
    fn task_lost(
        &mut self,
        index: usize,
        had_started: bool,
        when: DateTime<Utc>,
    ) -> Option<ExecutionOutcome> {
        self.current = None;
        self.last_task_finished = Some(when);
        if self.status != ExecutionStatus::Running {
            return None;
        }
        if had_started {
            return self.set_final_status(ExecutionStatus::Failed, when, Some(JobError::node_lost()));
        }
        if let Some(task) = self.tasks.get_mut(index) {
            task.update_task_id_for_lost_task();
            info!(job_exe.id = self.id, task.id = %task.id(), "Relaunching lost task");
        }
        self.remaining.push_front(index);
        None
    }

    fn current_task_mut(&mut self) -> Option<&mut ExecutionTask> {
        let index = self.current?;
        self.tasks.get_mut(index)
    }

    /// 只有 RUNNING 状态能转到最终状态；当前任务保留以便杀掉
    fn set_final_status(
        &mut self,
        status: ExecutionStatus,
        when: DateTime<Utc>,
        error: Option<JobError>,
    ) -> Option<ExecutionOutcome> {
        if self.status != ExecutionStatus::Running {
            return None;
        }
        self.remaining.clear();
        self.status = status;
        self.finished = Some(when);
        self.error = error.clone();
        match (status, error) {
            (ExecutionStatus::Completed, _) => Some(ExecutionOutcome::Completed { when }),
            (ExecutionStatus::Failed, Some(error)) => Some(ExecutionOutcome::Failed { when, error }),
            _ => None,
        }
    }
}
