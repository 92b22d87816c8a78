use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use orchestrator_core::{AppConfig, JobResources, SchedulerEvent};
use orchestrator_dispatcher::{
    BatchService, CommandContext, MessageProcessor, QueueManager, ScaleScheduler,
};
use orchestrator_domain::{
    BatchConfiguration, BatchDefinition, Dataset, DatasetFile, Interface, JobInterface, JobType,
    Parameter, RecipeDefinition, RecipeType, RecipeTypeRevision, Store,
};
use orchestrator_infrastructure::{InMemoryMessageQueue, InMemoryStore, MetricsCollector, SimulatedCluster};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

const DEMO_RECIPE_TYPE: &str = "demo-pipeline";

/// 主应用程序：内存存储、消息管道、作业队列、调度器和模拟集群
pub struct Application {
    store: Arc<dyn Store>,
    processor: Arc<MessageProcessor>,
    scheduler: Arc<ScaleScheduler>,
    cluster: SimulatedCluster,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Application {
    pub async fn new(mut config: AppConfig) -> Result<Self> {
        let local_hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        for agent in config.cluster.agents.iter_mut() {
            if agent.hostname.is_empty() {
                agent.hostname = local_hostname.clone();
            }
        }
        info!(
            host = %local_hostname,
            agents = config.cluster.agents.len(),
            paused = config.scheduler.paused,
            "初始化应用程序"
        );

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let metrics = MetricsCollector::new();
        let queue_manager = Arc::new(QueueManager::new(
            store.clone(),
            config.scheduler.clone(),
            metrics.clone(),
        ));
        let ctx = CommandContext::new(
            store.clone(),
            queue_manager.clone(),
            config.pipeline.clone(),
            metrics.clone(),
        );
        let queue = Arc::new(InMemoryMessageQueue::with_config(config.message_queue.clone()));
        let processor = Arc::new(MessageProcessor::new(ctx, queue));

        let (event_tx, events) = mpsc::unbounded_channel();
        let cluster = SimulatedCluster::new(config.cluster.clone(), event_tx);
        let scheduler = Arc::new(ScaleScheduler::new(
            config.scheduler.clone(),
            config.task_timeouts.clone(),
            store.clone(),
            queue_manager,
            Arc::new(cluster.clone()),
            processor.publisher().clone(),
            metrics,
        ));

        Ok(Self {
            store,
            processor,
            scheduler,
            cluster,
            events,
        })
    }

    /// 运行消息处理器、模拟集群和调度器，直到收到关闭信号
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) {
        info!("启动应用程序");
        let processor = tokio::spawn(self.processor.run(shutdown_rx.resubscribe()));
        let cluster = tokio::spawn(self.cluster.run(shutdown_rx.resubscribe()));
        let scheduler = tokio::spawn(self.scheduler.run(self.events, shutdown_rx));

        let results = futures::future::join_all([processor, cluster, scheduler]).await;
        for result in results {
            if let Err(e) = result {
                error!("组件异常退出: {e}");
            }
        }
        info!("所有组件已停止");
    }

    /// 创建演示用的作业类型、配方类型和数据集，并为数据集发起一个批次
    pub async fn seed_demo_batch(&self, file_count: usize) -> Result<()> {
        let now = Utc::now();
        let input = Interface::new().with_parameter(Parameter::file("INPUT", true, false));
        let mut definition = RecipeDefinition::new(input.clone());
        definition.add_job_node("ingest", "demo-ingest", "1.0", 1)?;
        definition.add_job_node("detect", "demo-detect", "1.0", 1)?;
        definition.add_job_node("classify", "demo-classify", "1.0", 1)?;
        definition.add_job_node("publish", "demo-publish", "1.0", 1)?;
        definition.add_dependency("ingest", "detect", true)?;
        definition.add_dependency("ingest", "classify", true)?;
        definition.add_dependency("detect", "publish", true)?;
        definition.add_dependency("classify", "publish", true)?;

        let mut tx = self.store.begin().await?;
        for (job_type_name, job_type_version) in definition.get_job_type_keys() {
            tx.save_job_type(JobType {
                id: 0,
                name: job_type_name.clone(),
                version: job_type_version,
                revision_num: 1,
                is_active: true,
                is_paused: false,
                is_system: false,
                is_long_running: false,
                max_tries: 3,
                priority: 100,
                timeout_seconds: 300,
                resources: JobResources::new(0.5, 128.0, 10.0, 10.0),
                interface: JobInterface {
                    command: format!("run-{job_type_name}"),
                    ..JobInterface::default()
                },
                created_at: now,
            })
            .await?;
        }
        let recipe_type = tx
            .save_recipe_type(RecipeType {
                id: 0,
                name: DEMO_RECIPE_TYPE.to_string(),
                title: "Demo pipeline".to_string(),
                revision_num: 1,
                is_active: true,
                is_system: false,
                created_at: now,
                updated_at: now,
            })
            .await?;
        tx.save_recipe_type_revision(RecipeTypeRevision {
            id: 0,
            recipe_type_id: recipe_type.id,
            recipe_type_name: recipe_type.name.clone(),
            revision_num: 1,
            definition,
            created_at: now,
        })
        .await?;
        let dataset = tx
            .save_dataset(Dataset {
                id: 0,
                name: "demo-files".to_string(),
                parameters: input,
                created_at: now,
            })
            .await?;
        let files = (1..=file_count as i64)
            .map(|file_id| DatasetFile {
                id: 0,
                dataset_id: dataset.id,
                file_id,
                parameter_name: "INPUT".to_string(),
            })
            .collect();
        tx.add_dataset_files(files).await?;
        tx.commit().await?;

        let (batch, message) = BatchService::new(self.store.clone())
            .create_batch(
                DEMO_RECIPE_TYPE,
                BatchDefinition::for_dataset(dataset.id),
                BatchConfiguration::default(),
                1,
            )
            .await?;
        self.processor
            .publisher()
            .publish(&message)
            .await
            .context("发布批次消息失败")?;
        info!(
            batch.id = batch.id,
            recipes_estimated = batch.recipes_estimated,
            "演示批次已创建"
        );
        Ok(())
    }
}
