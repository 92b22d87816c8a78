use serde::{Deserialize, Serialize};

/// 错误类别：SYSTEM 错误可自动重试，ALGORITHM/DATA 错误交给业务处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    #[serde(rename = "SYSTEM")]
    System,
    #[serde(rename = "ALGORITHM")]
    Algorithm,
    #[serde(rename = "DATA")]
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub name: String,
    pub title: String,
    pub description: String,
    pub category: ErrorCategory,
}

impl JobError {
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: description.into(),
            category,
        }
    }

    fn system(name: &str, title: &str, description: &str) -> Self {
        Self::new(name, title, description, ErrorCategory::System)
    }

    pub fn is_system(&self) -> bool {
        self.category == ErrorCategory::System
    }

    pub fn node_lost() -> Self {
        Self::system("node-lost", "Node Lost", "The node running the job was lost")
    }

    pub fn pull_timeout() -> Self {
        Self::system("pull-timeout", "Pull Timeout", "Pulling the job image timed out")
    }

    pub fn pre_timeout() -> Self {
        Self::system("pre-timeout", "Pre-Task Timeout", "The pre-task timed out")
    }

    /// 主任务超时属于算法错误
    pub fn timeout() -> Self {
        Self::new(
            "timeout",
            "Timeout",
            "The algorithm timed out",
            ErrorCategory::Algorithm,
        )
    }

    pub fn post_timeout() -> Self {
        Self::system("post-timeout", "Post-Task Timeout", "The post-task timed out")
    }

    pub fn system_timeout() -> Self {
        Self::system("system-timeout", "System Timeout", "The system job timed out")
    }

    pub fn docker_task_launch() -> Self {
        Self::system(
            "docker-task-launch",
            "Docker Task Launch",
            "The container for the task failed to launch",
        )
    }

    pub fn task_launch() -> Self {
        Self::system("task-launch", "Task Launch", "The task failed to launch")
    }

    pub fn pull() -> Self {
        Self::system("pull", "Image Pull", "Pulling the job image failed")
    }

    pub fn docker_terminated() -> Self {
        Self::system(
            "docker-terminated",
            "Docker Terminated",
            "The container was terminated unexpectedly",
        )
    }

    pub fn algorithm_unknown() -> Self {
        Self::new(
            "algorithm-unknown",
            "Algorithm Unknown",
            "The algorithm failed with an unknown exit code",
            ErrorCategory::Algorithm,
        )
    }

    pub fn scheduler_lost() -> Self {
        Self::system(
            "scheduler-lost",
            "Scheduler Lost",
            "The scheduler lost track of the job execution",
        )
    }

    pub fn unknown() -> Self {
        Self::system("unknown", "Unknown", "The job failed for an unknown reason")
    }

    pub fn builtin(name: &str) -> Option<Self> {
        let error = match name {
            "node-lost" => Self::node_lost(),
            "pull-timeout" => Self::pull_timeout(),
            "pre-timeout" => Self::pre_timeout(),
            "timeout" => Self::timeout(),
            "post-timeout" => Self::post_timeout(),
            "system-timeout" => Self::system_timeout(),
            "docker-task-launch" => Self::docker_task_launch(),
            "task-launch" => Self::task_launch(),
            "pull" => Self::pull(),
            "docker-terminated" => Self::docker_terminated(),
            "algorithm-unknown" => Self::algorithm_unknown(),
            "scheduler-lost" => Self::scheduler_lost(),
            "unknown" => Self::unknown(),
            _ => return None,
        };
        Some(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_categories() {
        assert!(JobError::node_lost().is_system());
        assert!(!JobError::timeout().is_system());
        assert_eq!(
            JobError::builtin("system-timeout").unwrap().category,
            ErrorCategory::System
        );
        assert!(JobError::builtin("not-a-builtin").is_none());
    }
}
