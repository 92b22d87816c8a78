use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use orchestrator_core::{Message, MessageQueue, MessageQueueConfig, OrchestratorError, OrchestratorResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 内存消息队列实现
///
/// 至少一次投递：取出的消息进入投递中状态，ack 后删除，nack 且 `requeue`
/// 时回到队尾并累计投递次数，超过 `max_deliveries` 的消息进入死信列表。
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    config: MessageQueueConfig,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Message>>,
    /// 消息 ID -> (队列名, 消息)
    in_flight: HashMap<String, (String, Message)>,
    dead_letters: Vec<Message>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_config(MessageQueueConfig::default())
    }

    pub fn with_config(config: MessageQueueConfig) -> Self {
        info!(
            capacity = config.capacity,
            max_deliveries = config.max_deliveries,
            "Creating in-memory message queue"
        );
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// 超过投递次数被丢弃的消息
    pub async fn dead_letters(&self) -> Vec<Message> {
        self.state.lock().await.dead_letters.clone()
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        let pending = state.queues.entry(queue.to_string()).or_default();
        if self.config.capacity > 0 && pending.len() >= self.config.capacity {
            warn!(queue, capacity = self.config.capacity, "Queue is full, message rejected");
            return Err(OrchestratorError::MessageQueue(format!(
                "Queue '{queue}' is full"
            )));
        }
        pending.push_back(message.clone());
        debug!(queue, message.id = %message.id, message.kind = %message.message_type, "Published message");
        Ok(())
    }

    async fn consume_messages(&self, queue: &str, max: usize) -> OrchestratorResult<Vec<Message>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(pending) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let count = max.min(pending.len());
        let messages: Vec<Message> = pending.drain(..count).collect();
        for message in &messages {
            state
                .in_flight
                .insert(message.id.clone(), (queue.to_string(), message.clone()));
        }
        if !messages.is_empty() {
            debug!(queue, count = messages.len(), "Consumed messages");
        }
        Ok(messages)
    }

    async fn ack_message(&self, message_id: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(message_id).is_none() {
            warn!(message.id = message_id, "Acknowledged a message that is not in flight");
        }
        Ok(())
    }

    async fn nack_message(&self, message_id: &str, requeue: bool) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        let Some((queue, mut message)) = state.in_flight.remove(message_id) else {
            warn!(message.id = message_id, "Rejected a message that is not in flight");
            return Ok(());
        };
        if !requeue {
            debug!(message.id = message_id, "Message rejected without requeue");
            return Ok(());
        }

        message.increment_retry();
        if message.is_retry_exhausted(self.config.max_deliveries as i32) {
            warn!(
                message.id = message_id,
                message.kind = %message.message_type,
                deliveries = message.retry_count,
                "Message exceeded maximum deliveries"
            );
            state.dead_letters.push(message);
        } else {
            state.queues.entry(queue).or_default().push_back(message);
        }
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> OrchestratorResult<u32> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, |pending| pending.len() as u32))
    }

    async fn get_in_flight_count(&self) -> OrchestratorResult<u32> {
        Ok(self.state.lock().await.in_flight.len() as u32)
    }

    async fn purge_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        let purged = state.queues.remove(queue).map_or(0, |pending| pending.len());
        info!(queue, purged, "Purged queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(n: i64) -> Message {
        Message::command("update_recipe", json!({"root_recipe_id": n}))
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let queue = InMemoryMessageQueue::new();
        for n in 0..3 {
            queue.publish_message("commands", &message(n)).await.unwrap();
        }
        assert_eq!(queue.get_queue_size("commands").await.unwrap(), 3);

        let batch = queue.consume_messages("commands", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload["root_recipe_id"], 0);
        assert_eq!(queue.get_queue_size("commands").await.unwrap(), 1);
        assert_eq!(queue.get_in_flight_count().await.unwrap(), 2);

        for message in &batch {
            queue.ack_message(&message.id).await.unwrap();
        }
        assert_eq!(queue.get_in_flight_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_requeues_until_exhausted() {
        let queue = InMemoryMessageQueue::with_config(MessageQueueConfig {
            capacity: 0,
            max_deliveries: 2,
        });
        queue.publish_message("commands", &message(1)).await.unwrap();

        let first = queue.consume_messages("commands", 10).await.unwrap();
        queue.nack_message(&first[0].id, true).await.unwrap();
        let second = queue.consume_messages("commands", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].retry_count, 1);

        queue.nack_message(&second[0].id, true).await.unwrap();
        assert_eq!(queue.get_queue_size("commands").await.unwrap(), 0);
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_and_purge() {
        let queue = InMemoryMessageQueue::with_config(MessageQueueConfig {
            capacity: 1,
            max_deliveries: 5,
        });
        queue.publish_message("commands", &message(1)).await.unwrap();
        assert!(queue.publish_message("commands", &message(2)).await.is_err());
        // 其他队列不受影响
        queue.publish_message("other", &message(3)).await.unwrap();

        queue.purge_queue("commands").await.unwrap();
        assert_eq!(queue.get_queue_size("commands").await.unwrap(), 0);
        assert_eq!(queue.get_queue_size("other").await.unwrap(), 1);
        assert!(queue.consume_messages("missing", 5).await.unwrap().is_empty());
    }
}
