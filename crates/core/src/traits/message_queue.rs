use async_trait::async_trait;

use crate::{models::Message, OrchestratorResult};

/// 消息队列抽象接口（至少一次投递）
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定队列
    async fn publish_message(&self, queue: &str, message: &Message) -> OrchestratorResult<()>;

    /// 从指定队列取出一批消息，消息在 ack/nack 之前处于投递中状态
    async fn consume_messages(&self, queue: &str, max: usize) -> OrchestratorResult<Vec<Message>>;

    /// 确认消息处理完成
    async fn ack_message(&self, message_id: &str) -> OrchestratorResult<()>;

    /// 拒绝消息，`requeue` 为真时重新入队
    async fn nack_message(&self, message_id: &str, requeue: bool) -> OrchestratorResult<()>;

    /// 获取队列中的消息数量（不含投递中的消息）
    async fn get_queue_size(&self, queue: &str) -> OrchestratorResult<u32>;

    /// 投递中尚未确认的消息数量
    async fn get_in_flight_count(&self) -> OrchestratorResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> OrchestratorResult<()>;
}
