use serde::{Deserialize, Serialize};

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// 每个队列允许积压的最大消息数，0 表示不限
    pub capacity: usize,
    /// 超过该投递次数的消息被丢弃
    pub max_deliveries: u32,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            max_deliveries: 5,
        }
    }
}

impl MessageQueueConfig {
    /// Validate message queue configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_deliveries == 0 {
            return Err(anyhow::anyhow!("消息最大投递次数必须大于0"));
        }
        Ok(())
    }
}
