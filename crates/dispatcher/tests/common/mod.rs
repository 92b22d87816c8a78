//! 集成测试共用的内存存储、消息管道与数据准备
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use orchestrator_core::{JobResources, PipelineConfig, SchedulerConfig};
use orchestrator_dispatcher::{
    CommandContext, CommandMessage, ExecutionAssignment, MessageProcessor, QueueManager,
};
use orchestrator_domain::{
    Dataset, DatasetFile, Interface, Job, JobInterface, JobType, Parameter, Recipe,
    RecipeDefinition, RecipeType, RecipeTypeRevision, Store, Transaction,
};
use orchestrator_infrastructure::{InMemoryMessageQueue, InMemoryStore, MetricsCollector};

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub queue_manager: Arc<QueueManager>,
    pub ctx: CommandContext,
    pub processor: MessageProcessor,
    pub metrics: MetricsCollector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pipeline(PipelineConfig::default())
    }

    pub fn with_pipeline(pipeline: PipelineConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let metrics = MetricsCollector::new();
        let queue_manager = Arc::new(QueueManager::new(
            store.clone(),
            SchedulerConfig::default(),
            metrics.clone(),
        ));
        let ctx = CommandContext::new(store.clone(), queue_manager.clone(), pipeline, metrics.clone());
        let processor = MessageProcessor::new(ctx.clone(), Arc::new(InMemoryMessageQueue::new()));
        Self {
            store,
            queue_manager,
            ctx,
            processor,
            metrics,
        }
    }

    pub async fn tx(&self) -> Box<dyn Transaction> {
        self.store.begin().await.unwrap()
    }

    /// 发布消息并处理到队列为空
    pub async fn run(&self, commands: &[CommandMessage]) -> usize {
        self.processor.publisher().publish_all(commands).await.unwrap();
        self.processor.drain().await.unwrap()
    }

    /// 调度队列中的全部执行，使其成功完成，再处理产生的消息。返回完成的作业 ID。
    pub async fn complete_queued(&self) -> Vec<i64> {
        let queue = self.queue_manager.get_queue().await.unwrap();
        let assignments: Vec<ExecutionAssignment> = queue
            .iter()
            .map(|entry| ExecutionAssignment {
                job_exe_id: entry.job_exe_id,
                node_id: 1,
                resources: entry.required,
            })
            .collect();
        let scheduled = self
            .queue_manager
            .schedule_job_executions(&assignments, Utc::now())
            .await
            .unwrap();

        let mut job_ids = Vec::new();
        for scheduled in scheduled {
            let messages = self
                .queue_manager
                .handle_job_completion(scheduled.job_exe.id, Utc::now(), None)
                .await
                .unwrap();
            job_ids.push(scheduled.job_exe.job_id);
            self.run(&messages).await;
        }
        job_ids
    }

    pub async fn recipe(&self, recipe_id: i64) -> Recipe {
        self.tx().await.get_recipes(&[recipe_id]).await.unwrap().remove(0)
    }

    /// 取代链上最新的配方
    pub async fn latest_recipe(&self, root_recipe_id: i64) -> Recipe {
        self.tx()
            .await
            .lock_latest_recipes(&[root_recipe_id])
            .await
            .unwrap()
            .remove(0)
    }

    /// 配方中某个子配方节点对应的子配方
    pub async fn sub_recipe(&self, recipe_id: i64, node_name: &str) -> Recipe {
        let mut tx = self.tx().await;
        let sub_recipe_id = tx
            .get_recipe_nodes(recipe_id)
            .await
            .unwrap()
            .into_iter()
            .find(|node| node.node_name == node_name)
            .and_then(|node| node.sub_recipe_id)
            .unwrap();
        tx.get_recipes(&[sub_recipe_id]).await.unwrap().remove(0)
    }

    /// 只调度并完成指定作业的排队执行
    pub async fn complete_job(&self, job_id: i64) {
        let entry = self
            .queue_manager
            .get_queue()
            .await
            .unwrap()
            .into_iter()
            .find(|entry| entry.job_id == job_id)
            .unwrap();
        self.queue_manager
            .schedule_job_executions(
                &[ExecutionAssignment {
                    job_exe_id: entry.job_exe_id,
                    node_id: 1,
                    resources: entry.required,
                }],
                Utc::now(),
            )
            .await
            .unwrap();
        let messages = self
            .queue_manager
            .handle_job_completion(entry.job_exe_id, Utc::now(), None)
            .await
            .unwrap();
        self.run(&messages).await;
    }

    pub async fn jobs_by_node(&self, recipe_id: i64) -> Vec<(String, Job)> {
        let mut tx = self.tx().await;
        let nodes = tx.get_recipe_nodes(recipe_id).await.unwrap();
        let job_ids: Vec<i64> = nodes.iter().filter_map(|node| node.job_id).collect();
        let jobs = tx.get_jobs(&job_ids).await.unwrap();
        let mut by_node: Vec<(String, Job)> = jobs
            .into_iter()
            .filter_map(|job| job.node_name.clone().map(|name| (name, job)))
            .collect();
        by_node.sort_by(|a, b| a.0.cmp(&b.0));
        by_node
    }
}

pub fn job_type(name: &str) -> JobType {
    JobType {
        id: 0,
        name: name.to_string(),
        version: "1.0".to_string(),
        revision_num: 1,
        is_active: true,
        is_paused: false,
        is_system: false,
        is_long_running: false,
        max_tries: 3,
        priority: 100,
        timeout_seconds: 600,
        resources: JobResources::new(1.0, 256.0, 10.0, 20.0),
        interface: JobInterface::default(),
        created_at: Utc::now(),
    }
}

pub fn input_interface() -> Interface {
    Interface::new().with_parameter(Parameter::file("INPUT", true, false))
}

/// a -> {b, c} -> d
pub fn diamond_definition() -> RecipeDefinition {
    diamond_definition_with_c_revision(1)
}

/// 菱形定义，c 节点使用指定的作业类型修订
pub fn diamond_definition_with_c_revision(c_revision: i32) -> RecipeDefinition {
    let mut definition = RecipeDefinition::new(input_interface());
    for name in ["a", "b", "c", "d"] {
        let revision = if name == "c" { c_revision } else { 1 };
        definition
            .add_job_node(name, &format!("job-{name}"), "1.0", revision)
            .unwrap();
    }
    definition.add_dependency("a", "b", true).unwrap();
    definition.add_dependency("a", "c", true).unwrap();
    definition.add_dependency("b", "d", true).unwrap();
    definition.add_dependency("c", "d", true).unwrap();
    definition
}

/// 子配方：x -> y
pub fn inner_definition() -> RecipeDefinition {
    let mut definition = RecipeDefinition::new(input_interface());
    definition.add_job_node("x", "job-x", "1.0", 1).unwrap();
    definition.add_job_node("y", "job-y", "1.0", 1).unwrap();
    definition.add_dependency("x", "y", true).unwrap();
    definition
}

/// a -> s，s 是 `inner` 的指定修订
pub fn outer_definition(inner_revision: i32) -> RecipeDefinition {
    let mut definition = RecipeDefinition::new(input_interface());
    definition.add_job_node("a", "job-a", "1.0", 1).unwrap();
    definition.add_recipe_node("s", "inner", inner_revision).unwrap();
    definition.add_dependency("a", "s", true).unwrap();
    definition
}

/// node_c -> node_d -> node_e，node_e 是 `inner` 子配方
pub fn chain_definition() -> RecipeDefinition {
    let mut definition = RecipeDefinition::new(input_interface());
    definition.add_job_node("node_c", "job-c", "1.0", 1).unwrap();
    definition.add_job_node("node_d", "job-d", "1.0", 1).unwrap();
    definition.add_recipe_node("node_e", "inner", 1).unwrap();
    definition.add_dependency("node_c", "node_d", true).unwrap();
    definition.add_dependency("node_d", "node_e", true).unwrap();
    definition
}

/// 保存定义用到的作业类型、配方类型及其修订
pub async fn seed_recipe_type(
    harness: &Harness,
    name: &str,
    revision_num: i32,
    definition: RecipeDefinition,
) -> RecipeTypeRevision {
    let mut tx = harness.tx().await;
    for (job_type_name, _) in definition.get_job_type_keys() {
        tx.save_job_type(job_type(&job_type_name)).await.unwrap();
    }
    let recipe_type = tx
        .save_recipe_type(RecipeType {
            id: 0,
            name: name.to_string(),
            title: name.to_string(),
            revision_num,
            is_active: true,
            is_system: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    let revision = tx
        .save_recipe_type_revision(RecipeTypeRevision {
            id: 0,
            recipe_type_id: recipe_type.id,
            recipe_type_name: recipe_type.name.clone(),
            revision_num,
            definition,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();
    revision
}

/// 每个文件作为 INPUT 参数的数据集
pub async fn seed_dataset(harness: &Harness, file_ids: &[i64]) -> Dataset {
    let mut tx = harness.tx().await;
    let dataset = tx
        .save_dataset(Dataset {
            id: 0,
            name: "scenes".to_string(),
            parameters: input_interface(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let files = file_ids
        .iter()
        .map(|file_id| DatasetFile {
            id: 0,
            dataset_id: dataset.id,
            file_id: *file_id,
            parameter_name: "INPUT".to_string(),
        })
        .collect();
    tx.add_dataset_files(files).await.unwrap();
    tx.commit().await.unwrap();
    dataset
}
