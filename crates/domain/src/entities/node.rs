use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 集群节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub hostname: String,
    pub agent_id: String,
    pub is_active: bool,
    /// 运维暂停
    pub is_paused: bool,
    /// 错误过多自动暂停
    pub is_paused_errors: bool,
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_offer_at: Option<DateTime<Utc>>,
}

impl Node {
    /// 首次收到供给时注册的节点（尚未分配 ID）
    pub fn new(agent_id: impl Into<String>, hostname: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            hostname: hostname.into(),
            agent_id: agent_id.into(),
            is_active: true,
            is_paused: false,
            is_paused_errors: false,
            pause_reason: None,
            created_at: when,
            last_offer_at: Some(when),
        }
    }

    /// 只有激活且未暂停的节点能接收新作业
    pub fn can_run_new_jobs(&self) -> bool {
        self.is_active && !self.is_paused && !self.is_paused_errors
    }

    pub fn pause_for_errors(&mut self, reason: impl Into<String>) {
        self.is_paused_errors = true;
        self.pause_reason = Some(reason.into());
    }
}
