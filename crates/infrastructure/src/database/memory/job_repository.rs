use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{
    Job, JobExecution, JobExecutionStatus, JobStatistics, JobStatus, JobType,
};
use orchestrator_domain::store::JobRepository;
use tracing::debug;

use super::{next_id, rows_by_ids, InMemoryTransaction};

#[async_trait]
impl JobRepository for InMemoryTransaction {
    async fn save_job_type(&mut self, mut job_type: JobType) -> OrchestratorResult<JobType> {
        let state = &mut self.working;
        if job_type.id == 0 {
            let existing = state
                .job_types
                .values()
                .find(|row| row.name == job_type.name && row.version == job_type.version)
                .map(|row| row.id);
            job_type.id = match existing {
                Some(id) => id,
                None => next_id(&mut state.sequences.job_type),
            };
        }
        state.job_types.insert(job_type.id, job_type.clone());
        Ok(job_type)
    }

    async fn get_job_type(&mut self, name: &str, version: &str) -> OrchestratorResult<Option<JobType>> {
        Ok(self
            .working
            .job_types
            .values()
            .find(|row| row.name == name && row.version == version)
            .cloned())
    }

    async fn get_job_type_by_id(&mut self, id: i64) -> OrchestratorResult<Option<JobType>> {
        Ok(self.working.job_types.get(&id).cloned())
    }

    async fn get_jobs(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Job>> {
        Ok(rows_by_ids(&self.working.jobs, ids))
    }

    async fn lock_jobs(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Job>> {
        Ok(rows_by_ids(&self.working.jobs, ids))
    }

    async fn create_jobs(&mut self, jobs: Vec<Job>) -> OrchestratorResult<Vec<Job>> {
        let state = &mut self.working;
        let mut created = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.id = next_id(&mut state.sequences.job);
            state.jobs.insert(job.id, job.clone());
            created.push(job);
        }
        debug!(count = created.len(), "Created jobs");
        Ok(created)
    }

    async fn update_job(&mut self, job: &Job) -> OrchestratorResult<()> {
        let row = self
            .working
            .jobs
            .get_mut(&job.id)
            .ok_or(OrchestratorError::JobNotFound { id: job.id })?;
        *row = job.clone();
        Ok(())
    }

    async fn supersede_jobs(&mut self, ids: &[i64], when: DateTime<Utc>) -> OrchestratorResult<()> {
        for id in ids {
            if let Some(job) = self.working.jobs.get_mut(id) {
                job.is_superseded = true;
                job.superseded = Some(when);
            }
        }
        Ok(())
    }

    async fn get_job_executions(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<JobExecution>> {
        Ok(rows_by_ids(&self.working.job_exes, ids))
    }

    async fn lock_job_executions(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<JobExecution>> {
        Ok(rows_by_ids(&self.working.job_exes, ids))
    }

    async fn lock_latest_job_execution(
        &mut self,
        job_id: i64,
    ) -> OrchestratorResult<Option<JobExecution>> {
        Ok(self
            .working
            .job_exes
            .values()
            .rev()
            .find(|exe| exe.job_id == job_id)
            .cloned())
    }

    async fn create_job_execution(&mut self, mut exe: JobExecution) -> OrchestratorResult<JobExecution> {
        let state = &mut self.working;
        exe.id = next_id(&mut state.sequences.job_exe);
        state.job_exes.insert(exe.id, exe.clone());
        Ok(exe)
    }

    async fn update_job_execution(&mut self, exe: &JobExecution) -> OrchestratorResult<()> {
        let row = self
            .working
            .job_exes
            .get_mut(&exe.id)
            .ok_or(OrchestratorError::JobExecutionNotFound { id: exe.id })?;
        *row = exe.clone();
        Ok(())
    }

    async fn count_node_system_failures(
        &mut self,
        node_id: i64,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<usize> {
        let job_ids: BTreeSet<i64> = self
            .working
            .job_exes
            .values()
            .filter(|exe| {
                exe.node_id == Some(node_id)
                    && exe.status == JobExecutionStatus::Failed
                    && exe.ended.is_some_and(|ended| ended >= since)
                    && exe.error.as_ref().is_some_and(|error| error.is_system())
            })
            .map(|exe| exe.job_id)
            .collect();
        Ok(job_ids.len())
    }

    async fn get_batch_job_statistics(&mut self, batch_id: i64) -> OrchestratorResult<Vec<JobStatistics>> {
        let mut grouped: BTreeMap<String, (JobStatistics, Vec<f64>)> = BTreeMap::new();
        let jobs = self
            .working
            .jobs
            .values()
            .filter(|job| job.batch_id == Some(batch_id) && !job.is_superseded);
        for job in jobs {
            let Some(node_name) = &job.node_name else {
                continue;
            };
            let (stats, durations) = grouped.entry(node_name.clone()).or_insert_with(|| {
                (
                    JobStatistics {
                        node_name: node_name.clone(),
                        ..JobStatistics::default()
                    },
                    Vec::new(),
                )
            });
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Blocked => stats.blocked += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Canceled => stats.canceled += 1,
            }
            if job.status == JobStatus::Completed {
                if let (Some(started), Some(ended)) = (job.started, job.ended) {
                    durations.push((ended - started).num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        Ok(grouped
            .into_values()
            .map(|(mut stats, durations)| {
                if !durations.is_empty() {
                    let sum: f64 = durations.iter().sum();
                    stats.min_duration = durations.iter().copied().reduce(f64::min);
                    stats.max_duration = durations.iter().copied().reduce(f64::max);
                    stats.avg_duration = Some(sum / durations.len() as f64);
                }
                stats
            })
            .collect())
    }
}
