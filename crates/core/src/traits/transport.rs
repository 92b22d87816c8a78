use async_trait::async_trait;

use crate::{models::TaskLaunch, OrchestratorResult};

/// 资源供给通道抽象
///
/// 供给、状态回报等异步事件通过 `SchedulerEvent` 通道送达调度循环，
/// 这里只定义调度器主动发起的操作。
#[async_trait]
pub trait ResourceTransport: Send + Sync {
    /// 在给定的供给上启动一批任务（同一节点）
    async fn launch_tasks(
        &self,
        offer_ids: &[String],
        tasks: Vec<TaskLaunch>,
    ) -> OrchestratorResult<()>;

    /// 拒绝未使用的供给
    async fn decline_offers(&self, offer_ids: &[String]) -> OrchestratorResult<()>;

    /// 杀掉任务，结果以 KILLED/LOST 状态回报
    async fn kill_task(&self, task_id: &str, agent_id: &str) -> OrchestratorResult<()>;

    /// 请求重新上报任务状态
    async fn reconcile_tasks(&self, task_ids: &[String]) -> OrchestratorResult<()>;
}
