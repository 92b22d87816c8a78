//! 作业执行中的单个任务（pull / pre / main / post）

use chrono::{DateTime, Duration, Utc};
use orchestrator_core::{NodeResources, TaskLaunch, TaskState, TaskStatusUpdate};
use orchestrator_domain::entities::{JobError, JobInterface};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// 任务启动后到进入 RUNNING 的最长时间
pub const STAGING_TIMEOUT_SECONDS: i64 = 120;
/// 超过该时间没有状态回报的任务需要对账
pub const RUNNING_RECON_SECONDS: i64 = 10 * 60;
pub const STAGING_RECON_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Pull,
    Pre,
    Main,
    Post,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Pull => "pull",
            TaskKind::Pre => "pre",
            TaskKind::Main => "main",
            TaskKind::Post => "post",
        }
    }

    /// 超时对应的错误；系统作业的主任务使用 system-timeout
    pub fn timeout_error(&self, is_system: bool) -> JobError {
        match self {
            TaskKind::Pull => JobError::pull_timeout(),
            TaskKind::Pre => JobError::pre_timeout(),
            TaskKind::Main if is_system => JobError::system_timeout(),
            TaskKind::Main => JobError::timeout(),
            TaskKind::Post => JobError::post_timeout(),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 一个执行任务的启动/运行/结束记录
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    id: String,
    base_id: String,
    lost_count: u32,
    pub kind: TaskKind,
    pub job_exe_id: i64,
    pub agent_id: String,
    pub name: String,
    pub resources: NodeResources,
    pub command: Option<String>,
    pub is_system: bool,
    running_timeout: Option<Duration>,
    staging_timeout: Duration,

    has_been_launched: bool,
    launched: Option<DateTime<Utc>>,
    has_started: bool,
    started: Option<DateTime<Utc>>,
    has_ended: bool,
    ended: Option<DateTime<Utc>>,
    has_timed_out: bool,
    needs_killed: bool,
    force_recon: bool,
    last_status_update: Option<DateTime<Utc>>,
    pub final_state: Option<TaskState>,
    pub exit_code: Option<i32>,
}

impl ExecutionTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TaskKind,
        job_exe_id: i64,
        agent_id: impl Into<String>,
        name: impl Into<String>,
        resources: NodeResources,
        command: Option<String>,
        is_system: bool,
        running_timeout: Option<Duration>,
    ) -> Self {
        let base_id = format!("{job_exe_id}_{}", kind.as_str());
        Self {
            id: base_id.clone(),
            base_id,
            lost_count: 0,
            kind,
            job_exe_id,
            agent_id: agent_id.into(),
            name: name.into(),
            resources,
            command,
            is_system,
            running_timeout,
            staging_timeout: Duration::seconds(STAGING_TIMEOUT_SECONDS),
            has_been_launched: false,
            launched: None,
            has_started: false,
            started: None,
            has_ended: false,
            ended: None,
            has_timed_out: false,
            needs_killed: false,
            force_recon: false,
            last_status_update: None,
            final_state: None,
            exit_code: None,
        }
    }

    /// 任务 ID 形如 `{exe_id}_{kind}`，丢失后重新启动时追加 `_{n}`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 由任务 ID 解析出作业执行 ID
    pub fn parse_job_exe_id(task_id: &str) -> Option<i64> {
        task_id.split('_').next()?.parse().ok()
    }

    pub fn has_been_launched(&self) -> bool {
        self.has_been_launched
    }

    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn has_ended(&self) -> bool {
        self.has_ended
    }

    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn ended(&self) -> Option<DateTime<Utc>> {
        self.ended
    }

    pub fn launch(&mut self, when: DateTime<Utc>) -> TaskLaunch {
        if self.has_been_launched {
            error!(task.id = %self.id, "Tried to launch a task that has already been launched");
        } else {
            self.has_been_launched = true;
            self.launched = Some(when);
            self.last_status_update = Some(when);
        }
        TaskLaunch {
            task_id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            resources: self.resources,
            command: self.command.clone(),
        }
    }

    /// 处理状态回报，重复的回报不会改变结果
    pub fn update(&mut self, update: &TaskStatusUpdate) {
        if self.id != update.task_id {
            return;
        }
        self.force_recon = false;
        self.last_status_update = Some(update.timestamp);
        if self.has_ended {
            return;
        }
        match update.state {
            TaskState::Staging => {}
            TaskState::Running => {
                if !self.has_started {
                    self.has_started = true;
                    self.started = Some(update.timestamp);
                }
            }
            TaskState::Lost => {
                // 回到启动前的状态
                self.has_been_launched = false;
                self.launched = None;
                self.last_status_update = None;
                self.has_started = false;
                self.started = None;
            }
            TaskState::Finished | TaskState::Failed | TaskState::Killed => {
                self.has_ended = true;
                self.ended = Some(update.timestamp);
                self.final_state = Some(update.state);
                self.exit_code = update.exit_code;
            }
        }
    }

    /// 丢失的任务以新 ID 重新启动
    pub fn update_task_id_for_lost_task(&mut self) {
        self.lost_count += 1;
        self.id = format!("{}_{}", self.base_id, self.lost_count);
        self.has_timed_out = false;
        self.needs_killed = false;
    }

    /// 超过阈值时标记超时并需要杀掉
    pub fn check_timeout(&mut self, when: DateTime<Utc>) -> bool {
        if !self.has_been_launched || self.has_timed_out || self.has_ended {
            return self.has_timed_out;
        }
        let timed_out = match (self.started, self.launched) {
            (Some(started), _) if self.has_started => self
                .running_timeout
                .is_some_and(|threshold| when - started > threshold),
            (_, Some(launched)) => {
                let timed_out = when - launched > self.staging_timeout;
                if timed_out {
                    warn!(
                        task.id = %self.id,
                        staging_seconds = self.staging_timeout.num_seconds(),
                        "Task failed to start running in time"
                    );
                }
                timed_out
            }
            _ => false,
        };
        if timed_out {
            self.has_timed_out = true;
            self.needs_killed = true;
        }
        self.has_timed_out
    }

    pub fn force_kill(&mut self) {
        self.needs_killed = true;
    }

    pub fn force_reconciliation(&mut self) {
        self.force_recon = true;
    }

    pub fn needs_killed(&self) -> bool {
        self.last_status_update.is_some() && !self.has_ended && self.needs_killed
    }

    pub fn needs_reconciliation(&self, when: DateTime<Utc>) -> bool {
        let Some(last) = self.last_status_update else {
            return false;
        };
        if self.force_recon {
            return true;
        }
        let threshold = if self.has_started {
            RUNNING_RECON_SECONDS
        } else {
            STAGING_RECON_SECONDS
        };
        when - last > Duration::seconds(threshold)
    }

    /// 失败原因：主任务按作业接口映射退出码，其余任务只区分启动失败
    pub fn determine_error(&self, update: &TaskStatusUpdate, interface: &JobInterface) -> Option<JobError> {
        if self.id != update.task_id {
            return None;
        }
        let error = match self.kind {
            TaskKind::Main if !self.is_system && self.has_started => {
                Some(interface.get_error(update.exit_code.unwrap_or(0)))
            }
            TaskKind::Pull if self.has_started => Some(JobError::pull()),
            _ => None,
        };
        error.or_else(|| {
            if !self.has_started {
                Some(JobError::docker_task_launch())
            } else if update.state == TaskState::Killed && self.has_timed_out {
                Some(self.kind.timeout_error(self.is_system))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: TaskKind) -> ExecutionTask {
        ExecutionTask::new(
            kind,
            12,
            "agent-1",
            "test",
            NodeResources::new(1.0, 128.0, 10.0),
            None,
            false,
            Some(Duration::seconds(60)),
        )
    }

    #[test]
    fn test_task_ids() {
        let mut main = task(TaskKind::Main);
        assert_eq!(main.id(), "12_main");
        main.update_task_id_for_lost_task();
        main.update_task_id_for_lost_task();
        assert_eq!(main.id(), "12_main_2");
        assert_eq!(ExecutionTask::parse_job_exe_id(main.id()), Some(12));
        assert_eq!(ExecutionTask::parse_job_exe_id("bogus"), None);
    }

    #[test]
    fn test_staging_then_running_timeout() {
        let start = Utc::now();
        let mut staged = task(TaskKind::Pre);
        assert!(!staged.check_timeout(start + Duration::hours(1)));
        staged.launch(start);
        assert!(!staged.check_timeout(start + Duration::seconds(60)));
        assert!(staged.check_timeout(start + Duration::seconds(STAGING_TIMEOUT_SECONDS + 1)));
        assert!(staged.needs_killed());

        let mut running = task(TaskKind::Main);
        running.launch(start);
        let started = start + Duration::seconds(100);
        running.update(&TaskStatusUpdate::new("12_main", TaskState::Running, started));
        assert!(!running.check_timeout(started + Duration::seconds(59)));
        assert!(running.check_timeout(started + Duration::seconds(61)));
    }

    #[test]
    fn test_lost_resets_launch_state() {
        let start = Utc::now();
        let mut pull = task(TaskKind::Pull);
        pull.launch(start);
        pull.update(&TaskStatusUpdate::new("12_pull", TaskState::Running, start));
        assert!(pull.has_started());
        pull.update(&TaskStatusUpdate::new("12_pull", TaskState::Lost, start));
        assert!(!pull.has_been_launched());
        assert!(!pull.has_started());
        assert!(!pull.needs_reconciliation(start + Duration::hours(1)));
    }

    #[test]
    fn test_reconciliation_threshold() {
        let start = Utc::now();
        let mut main = task(TaskKind::Main);
        main.launch(start);
        assert!(!main.needs_reconciliation(start + Duration::seconds(10)));
        assert!(main.needs_reconciliation(start + Duration::seconds(STAGING_RECON_SECONDS + 1)));
        main.update(&TaskStatusUpdate::new("12_main", TaskState::Running, start));
        assert!(!main.needs_reconciliation(start + Duration::seconds(STAGING_RECON_SECONDS + 1)));
        main.force_reconciliation();
        assert!(main.needs_reconciliation(start));
    }

    #[test]
    fn test_determine_error() {
        let interface = JobInterface::from_json(serde_json::json!({
            "errors": [{"code": 3, "name": "bad-input", "category": "data"}]
        }))
        .unwrap();
        let start = Utc::now();
        let mut main = task(TaskKind::Main);
        main.launch(start);
        let failed = TaskStatusUpdate::new("12_main", TaskState::Failed, start).with_exit_code(3);
        assert_eq!(main.determine_error(&failed, &interface).unwrap().name, "docker-task-launch");

        main.update(&TaskStatusUpdate::new("12_main", TaskState::Running, start));
        assert_eq!(main.determine_error(&failed, &interface).unwrap().name, "bad-input");
        let unmapped = TaskStatusUpdate::new("12_main", TaskState::Failed, start).with_exit_code(9);
        assert_eq!(main.determine_error(&unmapped, &interface).unwrap().name, "algorithm-unknown");
    }
}
