//! 作业队列
//!
//! 作业状态机 PENDING/BLOCKED -> QUEUED -> RUNNING -> {COMPLETED, FAILED, CANCELED}
//! 的所有持久化转换。每个公开方法在一个事务内完成，按 JobExecution -> Recipe -> Job
//! -> JobType 的顺序加锁；涉及配方的后续传播以消息形式返回，由调用方在提交后发布。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use orchestrator_core::{JobResources, OrchestratorError, OrchestratorResult, SchedulerConfig};
use orchestrator_domain::store::load_recipe_instance;
use orchestrator_domain::{
    Data, Job, JobError, JobExecution, JobExecutionStatus, JobStatus, JobType, QueueEntry,
    QueueStatus, Recipe, Store, Transaction,
};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger};
use tracing::{debug, info, instrument, warn};

use crate::messages::{CommandMessage, UpdateRecipe, UpdateRecipeMetrics};

/// 调度器为一个排队执行选定的节点与资源
#[derive(Debug, Clone)]
pub struct ExecutionAssignment {
    pub job_exe_id: i64,
    pub node_id: i64,
    pub resources: JobResources,
}

/// 已转为 RUNNING 的执行
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub job_exe: JobExecution,
    pub job_type: JobType,
    pub priority: i32,
}

pub struct QueueManager {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    metrics: MetricsCollector,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig, metrics: MetricsCollector) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// 创建一个独立作业并立即排队
    #[instrument(skip(self, input))]
    pub async fn queue_new_job(
        &self,
        job_type_name: &str,
        job_type_version: &str,
        input: Data,
        event_id: i64,
        priority: Option<i32>,
    ) -> OrchestratorResult<Job> {
        let when = Utc::now();
        let mut tx = self.store.begin().await?;
        let job_type = tx
            .get_job_type(job_type_name, job_type_version)
            .await?
            .ok_or_else(|| OrchestratorError::JobTypeNotFound {
                name: job_type_name.to_string(),
                version: job_type_version.to_string(),
            })?;
        if !job_type.is_active {
            return Err(OrchestratorError::InactiveJobType(format!(
                "{job_type_name} {job_type_version}"
            )));
        }
        input.validate(&job_type.interface.inputs)?;

        let mut job = Job::new(&job_type, event_id, when);
        job.input = Some(input);
        let job = tx
            .create_jobs(vec![job])
            .await?
            .pop()
            .ok_or_else(|| OrchestratorError::internal("作业创建后没有返回"))?;
        let queued = self.queue_jobs(tx.as_mut(), vec![job], priority, when).await?;
        tx.commit().await?;

        queued
            .into_iter()
            .next()
            .map(|(job, _)| job)
            .ok_or_else(|| OrchestratorError::invalid_data("JOB_NOT_QUEUED", "作业无法排队"))
    }

    /// 重新排队已有作业（需要已有输入）
    pub async fn queue_existing_jobs(
        &self,
        job_ids: &[i64],
        priority: Option<i32>,
    ) -> OrchestratorResult<Vec<JobExecution>> {
        let when = Utc::now();
        let mut tx = self.store.begin().await?;
        let jobs = tx.lock_jobs(job_ids).await?;
        let queued = self.queue_jobs(tx.as_mut(), jobs, priority, when).await?;
        tx.commit().await?;
        Ok(queued.into_iter().map(|(_, exe)| exe).collect())
    }

    /// 在调用方的事务内排队：创建执行和队列条目，作业转为 QUEUED。
    /// 不能排队或没有输入的作业被跳过。
    pub(crate) async fn queue_jobs(
        &self,
        tx: &mut dyn Transaction,
        jobs: Vec<Job>,
        priority: Option<i32>,
        when: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<(Job, JobExecution)>> {
        let mut job_types: BTreeMap<i64, JobType> = BTreeMap::new();
        let mut queued = Vec::with_capacity(jobs.len());

        for mut job in jobs {
            if !job.can_be_queued() || !job.has_input() {
                debug!(job.id = job.id, job.status = %job.status, "作业不能排队，跳过");
                continue;
            }
            if !job_types.contains_key(&job.job_type_id) {
                let job_type = tx.get_job_type_by_id(job.job_type_id).await?.ok_or_else(|| {
                    OrchestratorError::JobTypeNotFound {
                        name: job.job_type_name.clone(),
                        version: job.job_type_version.clone(),
                    }
                })?;
                job_types.insert(job_type.id, job_type);
            }
            let Some(job_type) = job_types.get(&job.job_type_id) else {
                continue;
            };

            if let Some(priority) = priority {
                job.priority = priority;
            }
            job.num_exes += 1;
            job.set_status(JobStatus::Queued, when);
            job.queued = Some(when);
            job.started = None;
            job.ended = None;
            job.error = None;
            tx.update_job(&job).await?;

            let exe = tx
                .create_job_execution(JobExecution {
                    id: 0,
                    job_id: job.id,
                    job_type_id: job.job_type_id,
                    exe_num: job.num_exes,
                    status: JobExecutionStatus::Queued,
                    node_id: None,
                    resources: job_type.resources,
                    error: None,
                    exit_code: None,
                    queued: when,
                    started: None,
                    ended: None,
                })
                .await?;
            tx.create_queue_entry(QueueEntry {
                job_exe_id: exe.id,
                job_id: job.id,
                job_type_id: job.job_type_id,
                job_type_name: job.job_type_name.clone(),
                exe_num: exe.exe_num,
                priority: job.priority,
                required: job_type.resources,
                queued: when,
            })
            .await?;

            StructuredLogger::log_job_queued(job.id, exe.id, &job.job_type_name, job.priority);
            queued.push((job, exe));
        }

        self.metrics.record_jobs_queued(queued.len());
        Ok(queued)
    }

    /// 执行成功完成
    #[instrument(skip(self, output))]
    pub async fn handle_job_completion(
        &self,
        job_exe_id: i64,
        when: DateTime<Utc>,
        output: Option<Data>,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut tx = self.store.begin().await?;
        let mut exe = lock_job_execution(tx.as_mut(), job_exe_id).await?;
        if exe.status != JobExecutionStatus::Running {
            debug!(job_exe.id = job_exe_id, status = ?exe.status, "执行不在运行中，忽略完成事件");
            return Ok(Vec::new());
        }
        let recipes = lock_job_recipes(tx.as_mut(), exe.job_id).await?;
        let mut job = lock_job(tx.as_mut(), exe.job_id).await?;

        exe.status = JobExecutionStatus::Completed;
        exe.ended = Some(when);
        tx.update_job_execution(&exe).await?;

        job.set_status(JobStatus::Completed, when);
        job.ended = Some(when);
        job.output = output;
        tx.update_job(&job).await?;
        tx.commit().await?;

        StructuredLogger::log_job_completed(exe.id, job.id, exe.duration_seconds());
        self.metrics.record_job_completed();
        Ok(recipe_messages(&recipes))
    }

    /// 执行失败。SYSTEM 错误且仍有重试次数，或长期运行的作业类型，会自动重新排队。
    #[instrument(skip(self, error), fields(error = %error.name))]
    pub async fn handle_job_failure(
        &self,
        job_exe_id: i64,
        when: DateTime<Utc>,
        error: JobError,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut tx = self.store.begin().await?;
        let mut exe = lock_job_execution(tx.as_mut(), job_exe_id).await?;
        if exe.status != JobExecutionStatus::Running {
            debug!(job_exe.id = job_exe_id, status = ?exe.status, "执行不在运行中，忽略失败事件");
            return Ok(Vec::new());
        }
        let recipes = lock_job_recipes(tx.as_mut(), exe.job_id).await?;
        let mut job = lock_job(tx.as_mut(), exe.job_id).await?;
        let job_type = tx.get_job_type_by_id(job.job_type_id).await?.ok_or_else(|| {
            OrchestratorError::JobTypeNotFound {
                name: job.job_type_name.clone(),
                version: job.job_type_version.clone(),
            }
        })?;

        exe.status = JobExecutionStatus::Failed;
        exe.error = Some(error.clone());
        exe.ended = Some(when);
        tx.update_job_execution(&exe).await?;

        let retry =
            (error.is_system() && job.num_exes < job.max_tries) || job_type.is_long_running;
        job.set_status(JobStatus::Failed, when);
        job.error = Some(error.clone());
        job.ended = Some(when);

        // 跳过排队的作业按失败处理，避免作业停留在 RUNNING
        let requeue = retry
            && !self
                .queue_jobs(tx.as_mut(), vec![job.clone()], None, when)
                .await?
                .is_empty();
        let messages = if requeue {
            Vec::new()
        } else {
            if retry {
                warn!(job.id = job.id, "作业无法重新排队，按失败处理");
            }
            tx.update_job(&job).await?;
            for recipe in &recipes {
                block_recipe_dependents(tx.as_mut(), recipe, when).await?;
            }
            if error.is_system() {
                if let Some(node_id) = exe.node_id {
                    self.check_node_errors(tx.as_mut(), node_id, when).await?;
                }
            }
            recipe_messages(&recipes)
        };
        tx.commit().await?;

        StructuredLogger::log_job_failed(exe.id, job.id, &error.name, requeue);
        self.metrics.record_job_failed(&error.name);
        Ok(messages)
    }

    /// 取消作业；排队中的执行连同队列条目一起取消
    #[instrument(skip(self))]
    pub async fn handle_job_cancellation(
        &self,
        job_id: i64,
        when: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let mut tx = self.store.begin().await?;
        let locked_exe = tx.lock_latest_job_execution(job_id).await?;
        let recipes = lock_job_recipes(tx.as_mut(), job_id).await?;
        let mut job = lock_job(tx.as_mut(), job_id).await?;

        // 加锁期间可能有新的执行被创建
        let latest_exe = tx.lock_latest_job_execution(job_id).await?;
        if locked_exe.as_ref().map(|exe| exe.id) != latest_exe.as_ref().map(|exe| exe.id) {
            return Err(OrchestratorError::status_conflict(format!(
                "作业 {job_id} 在取消时产生了新的执行"
            )));
        }
        if !job.can_be_canceled() {
            return Err(OrchestratorError::InvalidStatus(format!(
                "作业 {job_id} 处于 {} 状态，不能取消",
                job.status
            )));
        }

        let mut canceled_exe_id = None;
        if let Some(mut exe) = latest_exe.filter(|exe| exe.status.is_active()) {
            if exe.status == JobExecutionStatus::Queued {
                tx.delete_queue_entries(&[exe.id]).await?;
            }
            exe.status = JobExecutionStatus::Canceled;
            exe.ended = Some(when);
            tx.update_job_execution(&exe).await?;
            canceled_exe_id = Some(exe.id);
        }

        job.set_status(JobStatus::Canceled, when);
        job.ended = Some(when);
        tx.update_job(&job).await?;
        for recipe in &recipes {
            block_recipe_dependents(tx.as_mut(), recipe, when).await?;
        }
        tx.commit().await?;

        StructuredLogger::log_job_canceled(job.id, canceled_exe_id);
        self.metrics.record_job_canceled();
        Ok(recipe_messages(&recipes))
    }

    /// 重新排队 FAILED/CANCELED 的作业。从未执行过的作业转为 BLOCKED，由配方更新决定是否转回 PENDING；
    /// 执行过的作业获得一组新的重试次数后排队。
    #[instrument(skip(self))]
    pub async fn requeue_jobs(
        &self,
        job_ids: &[i64],
        priority: Option<i32>,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = self.store.begin().await?;
        let jobs = tx.lock_jobs(job_ids).await?;

        let mut to_queue = Vec::new();
        let mut recipe_ids = BTreeSet::new();
        for mut job in jobs {
            if !matches!(job.status, JobStatus::Failed | JobStatus::Canceled) {
                debug!(job.id = job.id, job.status = %job.status, "作业不需要重新排队");
                continue;
            }
            if let Some(recipe_id) = job.recipe_id {
                recipe_ids.insert(recipe_id);
            }
            if job.num_exes == 0 {
                job.set_status(JobStatus::Blocked, when);
                tx.update_job(&job).await?;
                continue;
            }
            let job_type = tx.get_job_type_by_id(job.job_type_id).await?.ok_or_else(|| {
                OrchestratorError::JobTypeNotFound {
                    name: job.job_type_name.clone(),
                    version: job.job_type_version.clone(),
                }
            })?;
            job.max_tries = job.num_exes + job_type.max_tries;
            to_queue.push(job);
        }

        let queued = self.queue_jobs(tx.as_mut(), to_queue, priority, when).await?;
        let recipe_ids: Vec<i64> = recipe_ids.into_iter().collect();
        let recipes = tx.get_recipes(&recipe_ids).await?;
        tx.commit().await?;

        info!(requested = job_ids.len(), queued = queued.len(), "作业重新排队");
        Ok(recipes
            .iter()
            .flat_map(|recipe| recipe_messages(std::slice::from_ref(recipe)))
            .collect())
    }

    /// 把排队中的执行转为 RUNNING。任何一个分配的资源不足都会使整批失败，不调度任何执行。
    pub async fn schedule_job_executions(
        &self,
        assignments: &[ExecutionAssignment],
        when: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<ScheduledExecution>> {
        if assignments.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.store.begin().await?;
        let exe_ids: Vec<i64> = assignments.iter().map(|a| a.job_exe_id).collect();
        let exes: BTreeMap<i64, JobExecution> = tx
            .lock_job_executions(&exe_ids)
            .await?
            .into_iter()
            .map(|exe| (exe.id, exe))
            .collect();
        let entries: BTreeMap<i64, QueueEntry> = tx
            .get_queue()
            .await?
            .into_iter()
            .filter(|entry| exes.contains_key(&entry.job_exe_id))
            .map(|entry| (entry.job_exe_id, entry))
            .collect();

        let mut to_schedule = Vec::new();
        for assignment in assignments {
            let Some(exe) = exes.get(&assignment.job_exe_id) else {
                warn!(job_exe.id = assignment.job_exe_id, "执行不存在，跳过调度");
                continue;
            };
            if exe.status != JobExecutionStatus::Queued {
                debug!(job_exe.id = exe.id, status = ?exe.status, "执行不在队列中，跳过调度");
                continue;
            }
            let Some(entry) = entries.get(&exe.id) else {
                continue;
            };
            let shortfall = assignment.resources.shortfall(&entry.required);
            if !shortfall.is_empty() {
                return Err(OrchestratorError::insufficient_resources(format!(
                    "执行 {} 的资源不足: {}",
                    exe.id,
                    shortfall.join(", ")
                )));
            }
            to_schedule.push((exe.clone(), assignment, entry.priority));
        }

        let job_ids: Vec<i64> = to_schedule.iter().map(|(exe, _, _)| exe.job_id).collect();
        let mut jobs: BTreeMap<i64, Job> = tx
            .lock_jobs(&job_ids)
            .await?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        let mut job_types: BTreeMap<i64, JobType> = BTreeMap::new();
        let mut scheduled = Vec::with_capacity(to_schedule.len());
        for (mut exe, assignment, priority) in to_schedule {
            exe.status = JobExecutionStatus::Running;
            exe.node_id = Some(assignment.node_id);
            exe.resources = assignment.resources;
            exe.started = Some(when);
            tx.update_job_execution(&exe).await?;

            if let Some(job) = jobs.get_mut(&exe.job_id) {
                job.set_status(JobStatus::Running, when);
                if job.started.is_none() {
                    job.started = Some(when);
                }
                tx.update_job(job).await?;
            }

            if !job_types.contains_key(&exe.job_type_id) {
                let job_type = tx.get_job_type_by_id(exe.job_type_id).await?.ok_or_else(|| {
                    OrchestratorError::internal(format!("执行 {} 的作业类型不存在", exe.id))
                })?;
                job_types.insert(job_type.id, job_type);
            }
            let job_type = job_types
                .get(&exe.job_type_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::internal("作业类型缓存缺失"))?;
            scheduled.push(ScheduledExecution {
                job_exe: exe,
                job_type,
                priority,
            });
        }

        let scheduled_ids: Vec<i64> = scheduled.iter().map(|s| s.job_exe.id).collect();
        tx.delete_queue_entries(&scheduled_ids).await?;
        tx.commit().await?;

        self.metrics.record_executions_scheduled(scheduled.len());
        Ok(scheduled)
    }

    /// 按优先级（数值小者优先）再按排队时间排序的队列
    pub async fn get_queue(&self) -> OrchestratorResult<Vec<QueueEntry>> {
        let mut tx = self.store.begin().await?;
        let mut queue = tx.get_queue().await?;
        drop(tx);
        queue.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.queued.cmp(&b.queued))
                .then(a.job_exe_id.cmp(&b.job_exe_id))
        });
        self.metrics.update_queue_depth(queue.len());
        Ok(queue)
    }

    /// 按作业类型汇总的队列状态
    pub async fn queue_status(&self) -> OrchestratorResult<Vec<QueueStatus>> {
        let queue = self.get_queue().await?;
        let mut status: BTreeMap<String, QueueStatus> = BTreeMap::new();
        for entry in queue {
            status
                .entry(entry.job_type_name.clone())
                .and_modify(|s| {
                    s.count += 1;
                    s.longest_queued = s.longest_queued.min(entry.queued);
                    s.highest_priority = s.highest_priority.min(entry.priority);
                })
                .or_insert(QueueStatus {
                    job_type_name: entry.job_type_name.clone(),
                    count: 1,
                    longest_queued: entry.queued,
                    highest_priority: entry.priority,
                });
        }
        Ok(status.into_values().collect())
    }

    /// 节点在错误窗口内的系统失败达到上限时暂停该节点
    async fn check_node_errors(
        &self,
        tx: &mut dyn Transaction,
        node_id: i64,
        when: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if self.config.max_node_errors == 0 {
            return Ok(());
        }
        let since = when - Duration::minutes(self.config.node_error_period_minutes);
        let failures = tx.count_node_system_failures(node_id, since).await?;
        if failures < self.config.max_node_errors {
            return Ok(());
        }
        let Some(mut node) = tx.get_nodes().await?.into_iter().find(|n| n.id == node_id) else {
            return Ok(());
        };
        if node.is_paused_errors {
            return Ok(());
        }
        let reason = format!(
            "{failures} system errors within {} minutes",
            self.config.node_error_period_minutes
        );
        node.pause_for_errors(reason.clone());
        tx.update_node(&node).await?;
        StructuredLogger::log_node_paused(node.id, &node.hostname, &reason);
        Ok(())
    }
}

async fn lock_job_execution(
    tx: &mut dyn Transaction,
    job_exe_id: i64,
) -> OrchestratorResult<JobExecution> {
    tx.lock_job_executions(&[job_exe_id])
        .await?
        .pop()
        .ok_or(OrchestratorError::JobExecutionNotFound { id: job_exe_id })
}

async fn lock_job(tx: &mut dyn Transaction, job_id: i64) -> OrchestratorResult<Job> {
    tx.lock_jobs(&[job_id])
        .await?
        .pop()
        .ok_or(OrchestratorError::JobNotFound { id: job_id })
}

/// 先读出作业所属配方再加锁，保证配方锁先于作业锁
///
/// 作业节点被复制到后继配方时，取代链上最新的配方也持有这个作业，一并返回。
async fn lock_job_recipes(tx: &mut dyn Transaction, job_id: i64) -> OrchestratorResult<Vec<Recipe>> {
    let job = tx
        .get_jobs(&[job_id])
        .await?
        .pop()
        .ok_or(OrchestratorError::JobNotFound { id: job_id })?;
    let Some(recipe_id) = job.recipe_id else {
        return Ok(Vec::new());
    };
    let mut recipes = tx.lock_recipes(&[recipe_id]).await?;
    let Some(root_id) = recipes.first().map(|recipe| recipe.root_superseded_recipe_id) else {
        return Ok(recipes);
    };
    if let Some(latest) = tx.lock_latest_recipes(&[root_id]).await?.pop() {
        if latest.id != recipe_id
            && tx
                .get_recipe_nodes(latest.id)
                .await?
                .iter()
                .any(|node| node.job_id == Some(job_id) && !node.is_original)
        {
            recipes.push(latest);
        }
    }
    Ok(recipes)
}

/// 作业进入终态后，把被它阻塞的同配方作业立即转为 BLOCKED
async fn block_recipe_dependents(
    tx: &mut dyn Transaction,
    recipe: &Recipe,
    when: DateTime<Utc>,
) -> OrchestratorResult<()> {
    let (_, mut instance) = load_recipe_instance(tx, recipe.clone()).await?;
    let blocked = instance.get_jobs_to_update().blocked;
    if blocked.is_empty() {
        return Ok(());
    }
    for mut job in tx.lock_jobs(&blocked).await? {
        if job.status == JobStatus::Pending {
            job.set_status(JobStatus::Blocked, when);
            tx.update_job(&job).await?;
        }
    }
    debug!(recipe.id = recipe.id, count = blocked.len(), "依赖作业已阻塞");
    Ok(())
}

/// 作业状态变化后重新计算持有该作业的配方计数，并更新取代链上最新的配方
fn recipe_messages(recipes: &[Recipe]) -> Vec<CommandMessage> {
    let Some(first) = recipes.first() else {
        return Vec::new();
    };
    vec![
        CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
            recipe_ids: recipes.iter().map(|recipe| recipe.id).collect(),
        }),
        CommandMessage::UpdateRecipe(UpdateRecipe {
            root_recipe_id: first.root_superseded_recipe_id,
            forced_nodes: None,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(id: i64, root: i64) -> Recipe {
        let revision = orchestrator_domain::RecipeTypeRevision {
            id: 1,
            recipe_type_id: 1,
            recipe_type_name: "r".to_string(),
            revision_num: 1,
            definition: orchestrator_domain::RecipeDefinition::new(
                orchestrator_domain::Interface::new(),
            ),
            created_at: Utc::now(),
        };
        let mut recipe = Recipe::new(&revision, 1, Utc::now());
        recipe.id = id;
        recipe.root_superseded_recipe_id = root;
        recipe
    }

    #[test]
    fn test_recipe_messages_target_chain_root() {
        let messages = recipe_messages(&[recipe(5, 2)]);
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0],
            CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics { recipe_ids: vec![5] })
        );
        assert_eq!(
            messages[1],
            CommandMessage::UpdateRecipe(UpdateRecipe {
                root_recipe_id: 2,
                forced_nodes: None
            })
        );
    }

    #[test]
    fn test_copied_job_refreshes_both_recipes() {
        let messages = recipe_messages(&[recipe(2, 2), recipe(7, 2)]);
        assert_eq!(
            messages[0],
            CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
                recipe_ids: vec![2, 7]
            })
        );
        assert_eq!(
            messages[1],
            CommandMessage::UpdateRecipe(UpdateRecipe {
                root_recipe_id: 2,
                forced_nodes: None
            })
        );
    }

    #[test]
    fn test_standalone_job_has_no_recipe_messages() {
        assert!(recipe_messages(&[]).is_empty());
    }
}
