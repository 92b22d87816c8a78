use chrono::{DateTime, Utc};
use orchestrator_core::{JobResources, OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use super::error::{ErrorCategory, JobError};
use crate::interface::{Data, Interface};

/// 作业接口中声明的退出码映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMapping {
    pub code: i32,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mapping_category")]
    pub category: MappedCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappedCategory {
    #[serde(alias = "job")]
    Algorithm,
    Data,
}

fn default_mapping_category() -> MappedCategory {
    MappedCategory::Algorithm
}

/// 作业类型的执行接口
///
/// 解码时补齐缺省值：`inputs`/`outputs` 缺失时为空接口，参数默认必填且单文件，`errors` 默认为空。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInterface {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub inputs: Interface,
    #[serde(default)]
    pub outputs: Interface,
    #[serde(default)]
    pub errors: Vec<ErrorMapping>,
}

impl JobInterface {
    pub fn from_json(value: serde_json::Value) -> OrchestratorResult<Self> {
        let interface: JobInterface = serde_json::from_value(value).map_err(|err| {
            OrchestratorError::invalid_definition("INVALID_INTERFACE", err.to_string())
        })?;
        interface.inputs.validate()?;
        interface.outputs.validate()?;
        Ok(interface)
    }

    /// 退出码对应的错误，未声明的退出码为 algorithm-unknown
    pub fn get_error(&self, exit_code: i32) -> JobError {
        self.errors
            .iter()
            .find(|mapping| mapping.code == exit_code)
            .map(|mapping| {
                let category = match mapping.category {
                    MappedCategory::Algorithm => ErrorCategory::Algorithm,
                    MappedCategory::Data => ErrorCategory::Data,
                };
                JobError::new(
                    mapping.name.clone(),
                    mapping.title.clone(),
                    mapping.description.clone(),
                    category,
                )
            })
            .unwrap_or_else(JobError::algorithm_unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobType {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub revision_num: i32,
    pub is_active: bool,
    pub is_paused: bool,
    pub is_system: bool,
    /// 长时间运行的作业失败后总是重新排队
    pub is_long_running: bool,
    pub max_tries: i32,
    pub priority: i32,
    /// 主任务超时（秒）
    pub timeout_seconds: i64,
    pub resources: JobResources,
    pub interface: JobInterface,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Blocked => "BLOCKED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Failed => "FAILED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type_id: i64,
    pub job_type_name: String,
    pub job_type_version: String,
    pub job_type_rev_num: i32,
    pub status: JobStatus,
    pub event_id: i64,
    pub recipe_id: Option<i64>,
    pub root_recipe_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub node_name: Option<String>,
    pub input: Option<Data>,
    pub output: Option<Data>,
    pub priority: i32,
    pub max_tries: i32,
    pub num_exes: i32,
    pub error: Option<JobError>,
    pub is_superseded: bool,
    pub superseded: Option<DateTime<Utc>>,
    pub superseded_job_id: Option<i64>,
    pub root_superseded_job_id: Option<i64>,
    pub unpublished: Option<DateTime<Utc>>,
    pub queued: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub last_status_change: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// 新作业（尚未分配 ID），初始为 PENDING
    pub fn new(job_type: &JobType, event_id: i64, when: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            job_type_id: job_type.id,
            job_type_name: job_type.name.clone(),
            job_type_version: job_type.version.clone(),
            job_type_rev_num: job_type.revision_num,
            status: JobStatus::Pending,
            event_id,
            recipe_id: None,
            root_recipe_id: None,
            batch_id: None,
            node_name: None,
            input: None,
            output: None,
            priority: job_type.priority,
            max_tries: job_type.max_tries,
            num_exes: 0,
            error: None,
            is_superseded: false,
            superseded: None,
            superseded_job_id: None,
            root_superseded_job_id: None,
            unpublished: None,
            queued: None,
            started: None,
            ended: None,
            last_status_change: when,
            created_at: when,
        }
    }

    /// 作为 `superseded` 的后继
    pub fn superseding(mut self, superseded: &Job) -> Self {
        self.superseded_job_id = Some(superseded.id);
        self.root_superseded_job_id = Some(superseded.root_superseded_job_id.unwrap_or(superseded.id));
        self
    }

    pub fn can_be_canceled(&self) -> bool {
        !matches!(self.status, JobStatus::Completed | JobStatus::Canceled)
    }

    pub fn can_be_queued(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Pending | JobStatus::Blocked | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn is_ready_for_children(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn set_status(&mut self, status: JobStatus, when: DateTime<Utc>) {
        self.status = status;
        self.last_status_change = when;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobExecutionStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl JobExecutionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobExecutionStatus::Queued | JobExecutionStatus::Running)
    }
}

/// 作业的一次执行尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    pub job_type_id: i64,
    pub exe_num: i32,
    pub status: JobExecutionStatus,
    pub node_id: Option<i64>,
    /// 排队时记录所需资源，调度后为实际分配的资源
    pub resources: JobResources,
    pub error: Option<JobError>,
    pub exit_code: Option<i32>,
    pub queued: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn is_finished(&self) -> bool {
        !self.status.is_active()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started, self.ended) {
            (Some(started), Some(ended)) => {
                Some((ended - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// 队列中的一个待调度执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_exe_id: i64,
    pub job_id: i64,
    pub job_type_id: i64,
    pub job_type_name: String,
    pub exe_num: i32,
    pub priority: i32,
    pub required: JobResources,
    pub queued: DateTime<Utc>,
}

/// 按作业类型汇总的队列状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub job_type_name: String,
    pub count: usize,
    pub longest_queued: DateTime<Utc>,
    pub highest_priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_interface_defaults() {
        let interface = JobInterface::from_json(json!({
            "command": "run.sh ${INPUT}",
            "inputs": {"files": [{"name": "INPUT"}]},
            "errors": [
                {"code": 1, "name": "bad-data", "category": "data"},
                {"code": 2, "name": "crashed", "category": "job"}
            ]
        }))
        .unwrap();

        let input = interface.inputs.get("INPUT").unwrap();
        assert!(input.required);
        assert!(interface.outputs.is_empty());

        assert_eq!(interface.get_error(1).category, ErrorCategory::Data);
        assert_eq!(interface.get_error(2).category, ErrorCategory::Algorithm);
        assert_eq!(interface.get_error(99).name, "algorithm-unknown");
    }

    #[test]
    fn test_outputs_defaults_written_to_outputs() {
        let interface = JobInterface::from_json(json!({
            "outputs": {"json": [{"name": "COUNT", "type": "integer"}]}
        }))
        .unwrap();
        assert!(interface.outputs.get("COUNT").unwrap().required);

        let encoded = serde_json::to_value(&interface).unwrap();
        assert!(encoded.get("outputs").is_some());
        assert!(encoded.get("ouputs").is_none());
    }

    #[test]
    fn test_invalid_json_type_rejected() {
        let result = JobInterface::from_json(json!({
            "inputs": {"json": [{"name": "X", "type": "float"}]}
        }));
        assert!(result.is_err());
    }
}
