//! 资源供给调度循环
//!
//! `ScaleScheduler` 消费集群送来的 `SchedulerEvent`：把供给分配给运行中执行的下一个任务和队列中的新执行，
//! 根据任务状态回报推进执行的状态机，并在节点丢失时使其上的执行失败。两个后台定时任务负责任务对账
//! 和与存储同步（取消、超时、节点暂停）。所有内存状态放在一个 `SchedulerContext` 中，由一把锁保护。

pub mod background;
pub mod context;
pub mod offer;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use orchestrator_core::{
    OrchestratorResult, ResourceOffer, ResourceTransport, SchedulerConfig, SchedulerEvent,
    TaskStatusUpdate, TaskTimeoutConfig,
};
use orchestrator_domain::{JobError, JobExecutionStatus, Node, Store};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger};
use orchestrator_worker::{ExecutionOutcome, ExecutionStatus, ExecutionTask, RunningJobExecution};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::messages::CommandMessage;
use crate::processor::CommandPublisher;
use crate::queue_manager::{ExecutionAssignment, QueueManager};

pub use context::SchedulerContext;
pub use offer::ScaleOffer;

/// 一轮供给处理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferRound {
    pub offers: usize,
    pub new_executions: usize,
    pub tasks_launched: usize,
    pub declined: usize,
}

pub struct ScaleScheduler {
    config: SchedulerConfig,
    timeouts: TaskTimeoutConfig,
    store: Arc<dyn Store>,
    queue_manager: Arc<QueueManager>,
    transport: Arc<dyn ResourceTransport>,
    publisher: CommandPublisher,
    metrics: MetricsCollector,
    context: Mutex<SchedulerContext>,
}

impl ScaleScheduler {
    pub fn new(
        config: SchedulerConfig,
        timeouts: TaskTimeoutConfig,
        store: Arc<dyn Store>,
        queue_manager: Arc<QueueManager>,
        transport: Arc<dyn ResourceTransport>,
        publisher: CommandPublisher,
        metrics: MetricsCollector,
    ) -> Self {
        let context = Mutex::new(SchedulerContext::new(config.paused));
        Self {
            config,
            timeouts,
            store,
            queue_manager,
            transport,
            publisher,
            metrics,
            context,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn set_paused(&self, paused: bool) {
        self.context.lock().await.set_paused(paused);
        info!(paused, "调度器暂停状态已更新");
    }

    pub async fn is_paused(&self) -> bool {
        self.context.lock().await.is_paused()
    }

    pub async fn running_execution_count(&self) -> usize {
        self.context.lock().await.running_count()
    }

    /// 当前在内存中跟踪的执行状态
    pub async fn execution_status(&self, job_exe_id: i64) -> Option<ExecutionStatus> {
        self.context
            .lock()
            .await
            .execution(job_exe_id)
            .map(|exe| exe.status())
    }

    /// 消费调度事件，直到收到关闭信号或事件通道关闭
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if !self.config.enabled {
            info!("调度器未启用");
            return;
        }
        let tickers = background::spawn(self.clone(), &shutdown);
        let paused = self.is_paused().await;
        info!(paused, "调度器启动");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("调度事件通道已关闭");
                        break;
                    }
                },
            }
        }

        for ticker in tickers {
            ticker.abort();
        }
        info!("调度器已停止");
    }

    pub async fn handle_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Offers(offers) => {
                self.resource_offers(offers).await;
            }
            SchedulerEvent::OfferRescinded { offer_id } => {
                // 供给只在一轮处理内使用，不需要额外清理
                debug!(offer.id = %offer_id, "供给被撤回");
            }
            SchedulerEvent::StatusUpdate(update) => self.status_update(update).await,
            SchedulerEvent::NodeLost { agent_id } => self.node_lost(&agent_id).await,
        }
    }

    /// 处理一批供给。出错时拒绝全部供给，不让集群等待未应答的供给。
    pub async fn resource_offers(&self, offers: Vec<ResourceOffer>) -> OfferRound {
        let started = Instant::now();
        let received = offers.len();
        let offer_ids: Vec<String> = offers.iter().map(|offer| offer.offer_id.clone()).collect();

        let round = match self.process_offers(offers).await {
            Ok(round) => round,
            Err(e) => {
                error!(error = %e, offers = received, "处理供给失败，拒绝全部供给");
                if let Err(e) = self.transport.decline_offers(&offer_ids).await {
                    error!(error = %e, "拒绝供给失败");
                }
                OfferRound {
                    offers: received,
                    declined: received,
                    ..OfferRound::default()
                }
            }
        };

        let elapsed = started.elapsed();
        self.metrics
            .record_offer_round(round.offers, round.declined, elapsed.as_secs_f64());
        StructuredLogger::log_offers_processed(
            round.offers,
            round.new_executions,
            round.declined,
            elapsed.as_millis() as u64,
        );
        round
    }

    async fn process_offers(&self, offers: Vec<ResourceOffer>) -> OrchestratorResult<OfferRound> {
        let when = Utc::now();
        let mut by_agent: BTreeMap<String, Vec<ResourceOffer>> = BTreeMap::new();
        for offer in offers {
            by_agent.entry(offer.agent_id.clone()).or_default().push(offer);
        }
        let mut round = OfferRound {
            offers: by_agent.values().map(Vec::len).sum(),
            ..OfferRound::default()
        };

        let mut ctx = self.context.lock().await;
        self.register_nodes(&mut ctx, &by_agent, when).await?;

        let mut scale_offers: Vec<ScaleOffer> = Vec::with_capacity(by_agent.len());
        for (agent_id, agent_offers) in &by_agent {
            let Some(node) = ctx.node(agent_id).cloned() else {
                continue;
            };
            scale_offers.push(ScaleOffer::new(node, agent_offers));
        }

        // 运行中执行的下一个任务优先，暂停时也照常启动
        let mut continuing: Vec<(i64, usize)> = Vec::new();
        for (index, scale_offer) in scale_offers.iter_mut().enumerate() {
            for exe in ctx.executions_on_node_mut(scale_offer.node.id) {
                if !exe.is_next_task_ready() {
                    continue;
                }
                let Some(required) = exe.next_task_resources() else {
                    continue;
                };
                if scale_offer.reserve(&required) {
                    continuing.push((exe.id, index));
                }
            }
        }

        let mut assignments: Vec<ExecutionAssignment> = Vec::new();
        let mut assigned_offers: BTreeMap<i64, usize> = BTreeMap::new();
        if !ctx.is_paused() {
            let max_new = self.config.max_new_executions_per_offer;
            for entry in self.queue_manager.get_queue().await? {
                let required = entry.required.as_node_resources();
                let target = scale_offers.iter_mut().enumerate().find_map(|(index, scale_offer)| {
                    let eligible = scale_offer.node.can_run_new_jobs()
                        && scale_offer.new_executions() < max_new;
                    (eligible && scale_offer.reserve_new_execution(&required))
                        .then_some((index, scale_offer.node.id))
                });
                if let Some((index, node_id)) = target {
                    assignments.push(ExecutionAssignment {
                        job_exe_id: entry.job_exe_id,
                        node_id,
                        resources: entry.required,
                    });
                    assigned_offers.insert(entry.job_exe_id, index);
                }
            }
        }

        let scheduled = match self
            .queue_manager
            .schedule_job_executions(&assignments, when)
            .await
        {
            Ok(scheduled) => scheduled,
            Err(e) => {
                // 新执行留在队列中，下一轮重新分配
                error!(error = %e, assignments = assignments.len(), "调度新执行失败");
                Vec::new()
            }
        };

        for (exe_id, index) in continuing {
            let launch = ctx
                .execution_mut(exe_id)
                .and_then(|exe| exe.start_next_task(when));
            if let (Some(task), Some(scale_offer)) = (launch, scale_offers.get_mut(index)) {
                scale_offer.add_task(task);
            }
        }

        for scheduled_exe in scheduled {
            let Some(scale_offer) = assigned_offers
                .get(&scheduled_exe.job_exe.id)
                .and_then(|index| scale_offers.get_mut(*index))
            else {
                continue;
            };
            let mut running = RunningJobExecution::new(
                scale_offer.agent_id(),
                &scheduled_exe.job_exe,
                &scheduled_exe.job_type,
                &self.timeouts,
                scheduled_exe.priority,
            );
            if let Some(task) = running.start_next_task(when) {
                scale_offer.add_task(task);
            }
            StructuredLogger::log_job_scheduled(
                scheduled_exe.job_exe.id,
                scheduled_exe.job_exe.job_id,
                scale_offer.node.id,
                &scale_offer.node.hostname,
            );
            ctx.add_execution(scale_offer.node.id, running);
            round.new_executions += 1;
        }

        for scale_offer in &mut scale_offers {
            if !scale_offer.has_tasks() {
                if let Err(e) = self.transport.decline_offers(scale_offer.offer_ids()).await {
                    error!(agent.id = scale_offer.agent_id(), error = %e, "拒绝供给失败");
                }
                round.declined += scale_offer.offer_ids().len();
                continue;
            }
            let tasks = scale_offer.take_tasks();
            let task_ids: Vec<String> = tasks.iter().map(|task| task.task_id.clone()).collect();
            round.tasks_launched += tasks.len();
            if let Err(e) = self.transport.launch_tasks(scale_offer.offer_ids(), tasks).await {
                // 启动结果未知，交给对账确认
                error!(agent.id = scale_offer.agent_id(), error = %e, "启动任务失败");
                for task_id in task_ids {
                    ctx.add_reconciliation(task_id);
                }
            }
        }

        self.metrics.update_running_executions(ctx.running_count());
        Ok(round)
    }

    /// 登记第一次出现的节点；已存在于存储中的节点重新激活
    async fn register_nodes(
        &self,
        ctx: &mut SchedulerContext,
        by_agent: &BTreeMap<String, Vec<ResourceOffer>>,
        when: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let unknown: Vec<(&String, &str)> = by_agent
            .iter()
            .filter(|(agent_id, _)| ctx.node(agent_id).is_none())
            .filter_map(|(agent_id, offers)| {
                offers.first().map(|offer| (agent_id, offer.hostname.as_str()))
            })
            .collect();

        if !unknown.is_empty() {
            let mut tx = self.store.begin().await?;
            let mut registered = Vec::with_capacity(unknown.len());
            for (agent_id, hostname) in unknown {
                let node = match tx.get_node_by_agent(agent_id).await? {
                    Some(mut node) => {
                        node.hostname = hostname.to_string();
                        node.is_active = true;
                        node.last_offer_at = Some(when);
                        tx.update_node(&node).await?;
                        node
                    }
                    None => tx.create_node(Node::new(agent_id.as_str(), hostname, when)).await?,
                };
                registered.push(node);
            }
            tx.commit().await?;
            for node in registered {
                info!(node.id = node.id, agent.id = %node.agent_id, hostname = %node.hostname, "节点已登记");
                ctx.upsert_node(node);
            }
        }

        for agent_id in by_agent.keys() {
            if let Some(mut node) = ctx.node(agent_id).cloned() {
                node.last_offer_at = Some(when);
                ctx.upsert_node(node);
            }
        }
        Ok(())
    }

    /// 任务状态回报。内存中没有对应执行时（例如调度器重启过）按系统错误使执行失败。
    #[instrument(skip(self, update), fields(task.id = %update.task_id, task.state = ?update.state))]
    pub async fn status_update(&self, update: TaskStatusUpdate) {
        let Some(exe_id) = ExecutionTask::parse_job_exe_id(&update.task_id) else {
            warn!("无法从任务 ID 解析执行 ID");
            return;
        };

        let known = {
            let mut ctx = self.context.lock().await;
            match ctx.execution_mut(exe_id) {
                Some(exe) => {
                    let outcome = exe.task_update(&update);
                    let finished = exe.is_finished();
                    if finished {
                        ctx.remove_execution(exe_id);
                        self.metrics.update_running_executions(ctx.running_count());
                    }
                    Some(outcome)
                }
                None => None,
            }
        };

        match known {
            Some(Some(outcome)) => self.apply_outcome(exe_id, outcome).await,
            Some(None) => {}
            None => {
                warn!(job_exe.id = exe_id, "收到未知执行的任务状态");
                if !update.state.is_terminal() {
                    if let Some(agent_id) = &update.agent_id {
                        if let Err(e) = self.transport.kill_task(&update.task_id, agent_id).await {
                            error!(error = %e, "杀掉未知任务失败");
                        }
                    }
                }
                let outcome = ExecutionOutcome::Failed {
                    when: update.timestamp,
                    error: JobError::scheduler_lost(),
                };
                self.apply_outcome(exe_id, outcome).await;
            }
        }
    }

    /// 节点丢失：其上所有执行以 node-lost 失败，节点从内存中移除，再次供给时重新登记
    #[instrument(skip(self))]
    pub async fn node_lost(&self, agent_id: &str) {
        let when = Utc::now();
        let (node, outcomes) = {
            let mut ctx = self.context.lock().await;
            let Some((node, executions)) = ctx.remove_node(agent_id) else {
                StructuredLogger::log_node_lost(agent_id, None, 0);
                return;
            };
            let outcomes: Vec<(i64, ExecutionOutcome)> = executions
                .into_iter()
                .filter_map(|mut exe| exe.execution_lost(when).map(|outcome| (exe.id, outcome)))
                .collect();
            self.metrics.update_running_executions(ctx.running_count());
            (node, outcomes)
        };

        self.metrics.record_node_lost();
        StructuredLogger::log_node_lost(agent_id, Some(&node.hostname), outcomes.len());
        for (exe_id, outcome) in outcomes {
            self.apply_outcome(exe_id, outcome).await;
        }
    }

    /// 对账：重试未写入的结果和未发布的消息，请求重新上报状态不明的任务
    pub async fn reconcile(&self) {
        let when = Utc::now();
        let (unapplied, unpublished, task_ids) = {
            let mut ctx = self.context.lock().await;
            let mut task_ids: BTreeSet<String> = ctx.take_reconciliation().into_iter().collect();
            task_ids.extend(ctx.executions_mut().filter_map(|exe| exe.needs_reconciliation(when)));
            (
                ctx.take_unapplied(),
                ctx.take_unpublished(),
                task_ids.into_iter().collect::<Vec<String>>(),
            )
        };

        for (exe_id, outcome) in unapplied {
            self.apply_outcome(exe_id, outcome).await;
        }
        if !unpublished.is_empty() {
            self.publish(unpublished).await;
        }

        if task_ids.is_empty() {
            return;
        }
        let remaining = match self.transport.reconcile_tasks(&task_ids).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, tasks = task_ids.len(), "任务对账请求失败");
                let mut ctx = self.context.lock().await;
                for task_id in &task_ids {
                    ctx.add_reconciliation(task_id.clone());
                }
                task_ids.len()
            }
        };
        self.metrics.record_tasks_reconciled(task_ids.len() - remaining);
        StructuredLogger::log_tasks_reconciled(task_ids.len(), remaining);
    }

    /// 与存储同步：节点暂停状态、被直接取消的执行、任务超时。需要杀掉的任务在这里发出杀掉命令。
    pub async fn sync_with_database(&self) -> OrchestratorResult<()> {
        let when = Utc::now();
        let exe_ids = self.context.lock().await.execution_ids();
        let (nodes, executions) = {
            let mut tx = self.store.begin().await?;
            let nodes = tx.get_nodes().await?;
            let executions = tx.get_job_executions(&exe_ids).await?;
            (nodes, executions)
        };

        let (to_kill, outcomes) = {
            let mut ctx = self.context.lock().await;
            for node in nodes {
                if ctx.node(&node.agent_id).is_some() {
                    ctx.upsert_node(node);
                }
            }

            for exe in executions
                .iter()
                .filter(|exe| exe.status == JobExecutionStatus::Canceled)
            {
                if let Some(running) = ctx.execution_mut(exe.id) {
                    if running.status() == ExecutionStatus::Running {
                        info!(job_exe.id = exe.id, "执行已在存储中取消");
                        running.execution_canceled(when);
                    }
                }
            }

            let outcomes: Vec<(i64, ExecutionOutcome)> = ctx
                .executions_mut()
                .filter_map(|exe| exe.check_timeout(when).map(|outcome| (exe.id, outcome)))
                .collect();
            let to_kill: Vec<(String, String)> = ctx
                .executions_mut()
                .filter_map(|exe| exe.task_to_kill())
                .collect();
            let removed = ctx.remove_finished();
            if !removed.is_empty() {
                debug!(count = removed.len(), "移除已结束的执行");
            }
            self.metrics.update_running_executions(ctx.running_count());
            (to_kill, outcomes)
        };

        for (task_id, agent_id) in to_kill {
            if let Err(e) = self.transport.kill_task(&task_id, &agent_id).await {
                error!(task.id = %task_id, error = %e, "杀掉任务失败");
            }
        }
        for (exe_id, outcome) in outcomes {
            self.apply_outcome(exe_id, outcome).await;
        }
        Ok(())
    }

    /// 把执行结果写入存储并发布后续消息；写入失败的结果留到对账时重试
    async fn apply_outcome(&self, exe_id: i64, outcome: ExecutionOutcome) {
        let result = match &outcome {
            ExecutionOutcome::Completed { when } => {
                self.queue_manager
                    .handle_job_completion(exe_id, *when, None)
                    .await
            }
            ExecutionOutcome::Failed { when, error } => {
                self.queue_manager
                    .handle_job_failure(exe_id, *when, error.clone())
                    .await
            }
        };
        match result {
            Ok(messages) => self.publish(messages).await,
            Err(e) => {
                error!(job_exe.id = exe_id, error = %e, "写入执行结果失败，稍后重试");
                self.context.lock().await.add_unapplied(exe_id, outcome);
            }
        }
    }

    async fn publish(&self, messages: Vec<CommandMessage>) {
        for (index, message) in messages.iter().enumerate() {
            if let Err(e) = self.publisher.publish(message).await {
                error!(error = %e, "发布后续消息失败，稍后重试");
                let unpublished = messages[index..].to_vec();
                self.context.lock().await.add_unpublished(unpublished);
                return;
            }
        }
    }
}
