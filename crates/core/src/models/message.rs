use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 队列中传输的消息信封
///
/// `message_type` 是命令种类（如 `create_recipes`），`payload` 为命令本身的 JSON。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i32,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn command(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: None,
        }
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn is_retry_exhausted(&self, max_retries: i32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 序列化后的字节数，用于约束单条消息体积
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope_round_trip() {
        let message = Message::command("update_recipe", serde_json::json!({"root_recipe_id": 7}))
            .with_correlation_id("batch-3".to_string());
        let json = message.serialize().unwrap();
        let decoded = Message::deserialize(&json).unwrap();
        assert_eq!(decoded, message);
        assert!(!decoded.is_retry_exhausted(1));
    }
}
