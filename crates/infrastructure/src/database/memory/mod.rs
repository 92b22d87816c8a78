//! 内存存储实现
//!
//! 事务之间完全串行：`begin` 取得整个存储的独占锁，事务在工作副本上读写，
//! 提交时整体写回，丢弃事务即回滚。`lock_*` 因此只是普通读取。
//! 同一任务内不要嵌套开启事务，否则会自己等待自己。

mod batch_repository;
mod job_repository;
mod node_repository;
mod queue_repository;
mod recipe_repository;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::entities::{
    Batch, BatchMetrics, Dataset, DatasetFile, Job, JobExecution, JobType, Node, QueueEntry,
    Recipe, RecipeNode, RecipeType, RecipeTypeRevision,
};
use orchestrator_domain::store::{Store, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Sequences {
    recipe_type: i64,
    revision: i64,
    recipe: i64,
    job_type: i64,
    job: i64,
    job_exe: i64,
    batch: i64,
    dataset: i64,
    dataset_file: i64,
    node: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// 存储的全部行
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    sequences: Sequences,
    recipe_types: BTreeMap<String, RecipeType>,
    revisions: BTreeMap<i64, RecipeTypeRevision>,
    recipes: BTreeMap<i64, Recipe>,
    /// 取代链根 -> 链上最新的配方，随配方创建维护
    latest_recipes: BTreeMap<i64, i64>,
    recipe_nodes: BTreeMap<(i64, String), RecipeNode>,
    job_types: BTreeMap<i64, JobType>,
    jobs: BTreeMap<i64, Job>,
    job_exes: BTreeMap<i64, JobExecution>,
    queue: BTreeMap<i64, QueueEntry>,
    batches: BTreeMap<i64, Batch>,
    batch_metrics: BTreeMap<i64, Vec<BatchMetrics>>,
    datasets: BTreeMap<i64, Dataset>,
    dataset_files: BTreeMap<i64, DatasetFile>,
    nodes: BTreeMap<i64, Node>,
}

/// 按 ID 升序取出存在的行
fn rows_by_ids<T: Clone>(rows: &BTreeMap<i64, T>, ids: &[i64]) -> Vec<T> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter().filter_map(|id| rows.get(id)).cloned().collect()
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> OrchestratorResult<Box<dyn Transaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, working }))
    }
}

/// 一个进行中的事务
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> OrchestratorResult<()> {
        let InMemoryTransaction { mut guard, working } = *self;
        *guard = working;
        debug!("Transaction committed");
        Ok(())
    }
}
