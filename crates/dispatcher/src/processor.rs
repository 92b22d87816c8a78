//! 命令消息处理
//!
//! `MessageProcessor` 从消息队列取出命令消息执行，把后续消息发布回同一队列后再确认。
//! 执行失败时可重试的错误重新入队，其余错误直接确认并记录，避免毒消息反复投递。

use std::sync::Arc;
use std::time::{Duration, Instant};

use orchestrator_core::{Message, MessageQueue, OrchestratorResult};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::messages::{CommandContext, CommandMessage};

/// 把命令消息发布到管道队列
#[derive(Clone)]
pub struct CommandPublisher {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
}

impl CommandPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub async fn publish(&self, command: &CommandMessage) -> OrchestratorResult<()> {
        let message = command.to_message()?;
        self.queue.publish_message(&self.queue_name, &message).await
    }

    /// 按顺序发布；调用方必须已提交产生这些消息的事务
    pub async fn publish_all(&self, commands: &[CommandMessage]) -> OrchestratorResult<()> {
        for command in commands {
            self.publish(command).await?;
        }
        Ok(())
    }
}

pub struct MessageProcessor {
    ctx: CommandContext,
    queue: Arc<dyn MessageQueue>,
    publisher: CommandPublisher,
}

impl MessageProcessor {
    pub fn new(ctx: CommandContext, queue: Arc<dyn MessageQueue>) -> Self {
        let publisher = CommandPublisher::new(queue.clone(), ctx.pipeline.queue_name.clone());
        Self {
            ctx,
            queue,
            publisher,
        }
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    /// 取出一批消息并依次处理，返回处理的消息数
    pub async fn process_next(&self, max: usize) -> OrchestratorResult<usize> {
        let messages = self
            .queue
            .consume_messages(self.publisher.queue_name(), max.max(1))
            .await?;
        let count = messages.len();
        for message in messages {
            self.handle(message).await?;
        }
        Ok(count)
    }

    /// 处理到队列为空，返回处理的消息总数
    pub async fn drain(&self) -> OrchestratorResult<usize> {
        let mut total = 0;
        loop {
            let processed = self.process_next(self.ctx.max_num()).await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        let command = match CommandMessage::from_message(&message) {
            Ok(command) => command,
            Err(e) => {
                error!(message.id = %message.id, message.kind = %message.message_type, error = %e, "无法解析命令消息，丢弃");
                return self.queue.ack_message(&message.id).await;
            }
        };

        let started = Instant::now();
        let result = command.execute(&self.ctx).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.ctx
            .metrics
            .record_message(command.message_type(), result.is_ok(), elapsed);

        match result {
            Ok(follow_ups) => {
                if let Err(e) = self.publisher.publish_all(&follow_ups).await {
                    // 重新执行会再次生成后续消息
                    warn!(message.id = %message.id, error = %e, "发布后续消息失败，消息重新入队");
                    return self.queue.nack_message(&message.id, true).await;
                }
                debug!(
                    message.id = %message.id,
                    message.kind = command.message_type(),
                    follow_ups = follow_ups.len(),
                    "命令消息已处理"
                );
                self.queue.ack_message(&message.id).await
            }
            Err(e) if e.is_retryable() => {
                warn!(message.id = %message.id, message.kind = command.message_type(), error = %e, "命令消息执行失败，重新入队");
                self.queue.nack_message(&message.id, true).await
            }
            Err(e) => {
                error!(message.id = %message.id, message.kind = command.message_type(), error = %e, "命令消息执行失败，不再重试");
                self.queue.ack_message(&message.id).await
            }
        }
    }

    /// 启动 `worker_count` 个工作任务，直到收到关闭信号
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) {
        let worker_count = self.ctx.pipeline.worker_count.max(1);
        let poll_interval = Duration::from_millis(self.ctx.pipeline.poll_interval_ms.max(1));
        info!(workers = worker_count, queue = self.publisher.queue_name(), "消息处理器启动");

        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let processor = self.clone();
            let mut shutdown = shutdown.resubscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        result = processor.process_next(1) => match result {
                            Ok(0) => tokio::time::sleep(poll_interval).await,
                            Ok(_) => {}
                            Err(e) => {
                                error!(worker, error = %e, "消费命令消息出错");
                                tokio::time::sleep(poll_interval).await;
                            }
                        },
                    }
                }
                debug!(worker, "消息处理任务退出");
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "消息处理任务异常退出");
            }
        }
        info!("消息处理器已停止");
    }
}
