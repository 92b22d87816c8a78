use serde::{Deserialize, Serialize};

/// 消息流水线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 单条消息携带的最大条目数（控制序列化体积）
    pub max_num: usize,
    /// 批次每页最多创建的配方数
    pub max_recipe_num: usize,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub queue_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_num: 100,
            max_recipe_num: 1000,
            worker_count: 4,
            poll_interval_ms: 200,
            queue_name: "orchestrator-commands".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_num == 0 {
            return Err(anyhow::anyhow!("单条消息最大条目数必须大于0"));
        }

        if self.max_recipe_num == 0 {
            return Err(anyhow::anyhow!("批次分页大小必须大于0"));
        }

        if self.worker_count == 0 {
            return Err(anyhow::anyhow!("消息处理线程数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("消息轮询间隔必须大于0"));
        }

        if self.queue_name.is_empty() {
            return Err(anyhow::anyhow!("命令队列名称不能为空"));
        }

        Ok(())
    }
}

/// 资源供给调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 暂停时只推进已在运行的执行，不再领取新作业
    pub paused: bool,
    pub reconciliation_interval_seconds: u64,
    pub db_sync_interval_seconds: u64,
    /// 统计节点系统错误的时间窗口
    pub node_error_period_minutes: i64,
    pub max_node_errors: usize,
    /// 单次供给最多领取的新作业数
    pub max_new_executions_per_offer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paused: false,
            reconciliation_interval_seconds: 30,
            db_sync_interval_seconds: 10,
            node_error_period_minutes: 1,
            max_node_errors: 5,
            max_new_executions_per_offer: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconciliation_interval_seconds == 0 {
            return Err(anyhow::anyhow!("任务对账间隔必须大于0"));
        }

        if self.db_sync_interval_seconds == 0 {
            return Err(anyhow::anyhow!("数据库同步间隔必须大于0"));
        }

        if self.node_error_period_minutes < 0 {
            return Err(anyhow::anyhow!("节点错误统计周期不能为负数"));
        }

        if self.max_node_errors == 0 {
            return Err(anyhow::anyhow!("节点最大错误数必须大于0"));
        }

        if self.max_new_executions_per_offer == 0 {
            return Err(anyhow::anyhow!("单次供给领取作业数必须大于0"));
        }

        Ok(())
    }
}

/// 各阶段任务的超时时间（main 任务超时由作业类型决定）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTimeoutConfig {
    pub pull_seconds: i64,
    pub pre_seconds: i64,
    pub post_seconds: i64,
    pub system_seconds: i64,
}

impl Default for TaskTimeoutConfig {
    fn default() -> Self {
        Self {
            pull_seconds: 30 * 60,
            pre_seconds: 60 * 60,
            post_seconds: 60 * 60,
            system_seconds: 60 * 60,
        }
    }
}

impl TaskTimeoutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("pull", self.pull_seconds),
            ("pre", self.pre_seconds),
            ("post", self.post_seconds),
            ("system", self.system_seconds),
        ] {
            if value <= 0 {
                return Err(anyhow::anyhow!("{name} 任务超时时间必须大于0"));
            }
        }
        Ok(())
    }
}
