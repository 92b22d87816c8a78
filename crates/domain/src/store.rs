//! 存储抽象
//!
//! 所有读写都发生在一个事务内；`lock_*` 方法在事务提交前持有行锁。
//! 加锁顺序固定为 JobExecution -> Recipe -> Job -> RecipeType -> JobType。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::entities::{
    Batch, BatchMetrics, Dataset, DatasetFile, Job, JobExecution, JobStatistics, JobType, Node,
    QueueEntry, Recipe, RecipeNode, RecipeNodeCopy, RecipeType, RecipeTypeRevision,
};
use crate::instance::{RecipeInstance, RecipeNodeDetails};
use crate::interface::Data;

/// 配方、配方类型与配方节点
#[async_trait]
pub trait RecipeRepository: Send {
    async fn save_recipe_type(&mut self, recipe_type: RecipeType) -> OrchestratorResult<RecipeType>;
    async fn get_recipe_type(&mut self, name: &str) -> OrchestratorResult<Option<RecipeType>>;
    async fn save_recipe_type_revision(
        &mut self,
        revision: RecipeTypeRevision,
    ) -> OrchestratorResult<RecipeTypeRevision>;
    async fn get_recipe_type_revision(
        &mut self,
        recipe_type_name: &str,
        revision_num: i32,
    ) -> OrchestratorResult<Option<RecipeTypeRevision>>;
    async fn get_recipe_type_revision_by_id(
        &mut self,
        id: i64,
    ) -> OrchestratorResult<Option<RecipeTypeRevision>>;

    async fn get_recipes(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Recipe>>;
    /// 按 ID 升序加锁
    async fn lock_recipes(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Recipe>>;
    /// 每条取代链上最新（未被取代）的配方，并加锁
    async fn lock_latest_recipes(&mut self, root_ids: &[i64]) -> OrchestratorResult<Vec<Recipe>>;
    /// 给定事件为这些链创建的后继配方
    async fn find_superseding_recipes(
        &mut self,
        root_ids: &[i64],
        event_id: i64,
    ) -> OrchestratorResult<Vec<Recipe>>;
    async fn find_new_recipe(
        &mut self,
        recipe_type_rev_id: i64,
        event_id: i64,
        ingest_event_id: Option<i64>,
        batch_id: Option<i64>,
        input: Option<&Data>,
    ) -> OrchestratorResult<Option<Recipe>>;
    /// 顶层、未被取代、输入包含这些文件的配方，按 ID 降序
    async fn find_recipes_for_files(
        &mut self,
        recipe_type_id: i64,
        file_ids: &[i64],
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<Recipe>>;
    /// 批次中的顶层配方，按 ID 降序
    async fn find_batch_recipes(
        &mut self,
        batch_id: i64,
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<Recipe>>;
    /// 分配 ID；没有前驱的配方以自身为取代链的根
    async fn create_recipes(&mut self, recipes: Vec<Recipe>) -> OrchestratorResult<Vec<Recipe>>;
    async fn update_recipe(&mut self, recipe: &Recipe) -> OrchestratorResult<()>;
    async fn supersede_recipes(&mut self, ids: &[i64], when: DateTime<Utc>) -> OrchestratorResult<()>;

    async fn get_recipe_nodes(&mut self, recipe_id: i64) -> OrchestratorResult<Vec<RecipeNode>>;
    async fn create_recipe_nodes(&mut self, nodes: Vec<RecipeNode>) -> OrchestratorResult<()>;
    /// 复制已有节点行（`is_original = false`），新配方中已存在的节点名跳过
    async fn copy_recipe_nodes(&mut self, copies: Vec<RecipeNodeCopy>) -> OrchestratorResult<()>;
    /// 作为子配方出现时的父节点行
    async fn get_parent_node(&mut self, sub_recipe_id: i64) -> OrchestratorResult<Option<RecipeNode>>;
}

/// 作业类型、作业与作业执行
#[async_trait]
pub trait JobRepository: Send {
    async fn save_job_type(&mut self, job_type: JobType) -> OrchestratorResult<JobType>;
    async fn get_job_type(&mut self, name: &str, version: &str) -> OrchestratorResult<Option<JobType>>;
    async fn get_job_type_by_id(&mut self, id: i64) -> OrchestratorResult<Option<JobType>>;

    async fn get_jobs(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Job>>;
    async fn lock_jobs(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Job>>;
    async fn create_jobs(&mut self, jobs: Vec<Job>) -> OrchestratorResult<Vec<Job>>;
    async fn update_job(&mut self, job: &Job) -> OrchestratorResult<()>;
    async fn supersede_jobs(&mut self, ids: &[i64], when: DateTime<Utc>) -> OrchestratorResult<()>;

    async fn get_job_executions(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<JobExecution>>;
    async fn lock_job_executions(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<JobExecution>>;
    async fn lock_latest_job_execution(
        &mut self,
        job_id: i64,
    ) -> OrchestratorResult<Option<JobExecution>>;
    async fn create_job_execution(&mut self, exe: JobExecution) -> OrchestratorResult<JobExecution>;
    async fn update_job_execution(&mut self, exe: &JobExecution) -> OrchestratorResult<()>;
    /// 某节点自 `since` 起因 SYSTEM 错误失败的不同作业数
    async fn count_node_system_failures(
        &mut self,
        node_id: i64,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<usize>;
    /// 批次内作业按节点名分组的聚合
    async fn get_batch_job_statistics(&mut self, batch_id: i64) -> OrchestratorResult<Vec<JobStatistics>>;
}

#[async_trait]
pub trait QueueRepository: Send {
    async fn create_queue_entry(&mut self, entry: QueueEntry) -> OrchestratorResult<()>;
    /// 优先级升序（数字越小越优先），同优先级先入队者在前
    async fn get_queue(&mut self) -> OrchestratorResult<Vec<QueueEntry>>;
    async fn delete_queue_entries(&mut self, job_exe_ids: &[i64]) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait BatchRepository: Send {
    async fn create_batch(&mut self, batch: Batch) -> OrchestratorResult<Batch>;
    async fn get_batch(&mut self, id: i64) -> OrchestratorResult<Option<Batch>>;
    async fn lock_batch(&mut self, id: i64) -> OrchestratorResult<Option<Batch>>;
    async fn update_batch(&mut self, batch: &Batch) -> OrchestratorResult<()>;
    /// 批次链上最新（未被取代）的批次
    async fn get_latest_batch(&mut self, root_batch_id: i64) -> OrchestratorResult<Option<Batch>>;
    /// 批次中顶层配方的 (总数, 已完成数)
    async fn count_batch_recipes(&mut self, batch_id: i64) -> OrchestratorResult<(i64, i64)>;
    async fn save_batch_metrics(&mut self, batch_id: i64, metrics: Vec<BatchMetrics>) -> OrchestratorResult<()>;
    async fn get_batch_metrics(&mut self, batch_id: i64) -> OrchestratorResult<Vec<BatchMetrics>>;

    async fn save_dataset(&mut self, dataset: Dataset) -> OrchestratorResult<Dataset>;
    async fn get_dataset(&mut self, id: i64) -> OrchestratorResult<Option<Dataset>>;
    async fn add_dataset_files(&mut self, files: Vec<DatasetFile>) -> OrchestratorResult<Vec<DatasetFile>>;
    /// 数据集文件，按 ID 降序，排除 `exclude_file_ids`
    async fn find_dataset_files(
        &mut self,
        dataset_id: i64,
        exclude_file_ids: &[i64],
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<DatasetFile>>;
    async fn count_dataset_files(&mut self, dataset_id: i64) -> OrchestratorResult<i64>;
}

#[async_trait]
pub trait NodeRepository: Send {
    async fn get_nodes(&mut self) -> OrchestratorResult<Vec<Node>>;
    async fn get_node_by_agent(&mut self, agent_id: &str) -> OrchestratorResult<Option<Node>>;
    async fn create_node(&mut self, node: Node) -> OrchestratorResult<Node>;
    async fn update_node(&mut self, node: &Node) -> OrchestratorResult<()>;
}

/// 一个存储事务；丢弃而不提交即回滚
#[async_trait]
pub trait Transaction:
    RecipeRepository + JobRepository + QueueRepository + BatchRepository + NodeRepository + Send
{
    async fn commit(self: Box<Self>) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> OrchestratorResult<Box<dyn Transaction>>;
}

/// 加载配方的修订定义、节点及其作业/子配方，组装成实例
pub async fn load_recipe_instance(
    tx: &mut dyn Transaction,
    recipe: Recipe,
) -> OrchestratorResult<(RecipeTypeRevision, RecipeInstance)> {
    let revision = tx
        .get_recipe_type_revision_by_id(recipe.recipe_type_rev_id)
        .await?
        .ok_or_else(|| OrchestratorError::RecipeTypeRevisionNotFound {
            name: recipe.recipe_type_name.clone(),
            revision_num: recipe.revision_num,
        })?;

    let nodes = tx.get_recipe_nodes(recipe.id).await?;
    let job_ids: Vec<i64> = nodes.iter().filter_map(|node| node.job_id).collect();
    let sub_recipe_ids: Vec<i64> = nodes.iter().filter_map(|node| node.sub_recipe_id).collect();
    let mut jobs: BTreeMap<i64, Job> = tx
        .get_jobs(&job_ids)
        .await?
        .into_iter()
        .map(|job| (job.id, job))
        .collect();
    let mut sub_recipes: BTreeMap<i64, Recipe> = tx
        .get_recipes(&sub_recipe_ids)
        .await?
        .into_iter()
        .map(|sub| (sub.id, sub))
        .collect();

    let details = nodes
        .into_iter()
        .map(|node| RecipeNodeDetails {
            job: node.job_id.and_then(|id| jobs.remove(&id)),
            sub_recipe: node.sub_recipe_id.and_then(|id| sub_recipes.remove(&id)),
            node,
        })
        .collect();

    let instance = RecipeInstance::new(&revision.definition, recipe, details)?;
    Ok((revision, instance))
}
