//! Structured logging utilities
//!
//! 编排器关键事件的结构化日志，字段名统一使用 `recipe.*`、`job.*`、
//! `node.*` 前缀，便于 JSON 日志检索。

use tracing::{error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log recipes created by a create_recipes message
    pub fn log_recipes_created(
        create_type: &str,
        recipe_type_name: &str,
        count: usize,
        event_id: i64,
        batch_id: Option<i64>,
    ) {
        info!(
            event = "recipes_created",
            recipe.create_type = create_type,
            recipe.type_name = recipe_type_name,
            recipe.count = count,
            recipe.event_id = event_id,
            recipe.batch_id = ?batch_id,
            "Recipes created"
        );
    }

    /// Log recipe nodes superseded inside a recipe chain
    pub fn log_nodes_superseded(recipe_id: i64, jobs: usize, sub_recipes: usize, unpublish: bool) {
        info!(
            event = "nodes_superseded",
            recipe.id = recipe_id,
            superseded.jobs = jobs,
            superseded.sub_recipes = sub_recipes,
            superseded.unpublish = unpublish,
            "Recipe nodes superseded"
        );
    }

    pub fn log_job_queued(job_id: i64, job_exe_id: i64, job_type_name: &str, priority: i32) {
        info!(
            event = "job_queued",
            job.id = job_id,
            job_exe.id = job_exe_id,
            job.type_name = job_type_name,
            job.priority = priority,
            "Job queued"
        );
    }

    pub fn log_job_scheduled(job_exe_id: i64, job_id: i64, node_id: i64, hostname: &str) {
        info!(
            event = "job_scheduled",
            job_exe.id = job_exe_id,
            job.id = job_id,
            node.id = node_id,
            node.hostname = hostname,
            "Job execution scheduled"
        );
    }

    pub fn log_job_completed(job_exe_id: i64, job_id: i64, duration_seconds: Option<f64>) {
        info!(
            event = "job_completed",
            job_exe.id = job_exe_id,
            job.id = job_id,
            job.duration_seconds = ?duration_seconds,
            "Job execution completed"
        );
    }

    pub fn log_job_failed(job_exe_id: i64, job_id: i64, error_name: &str, requeued: bool) {
        if requeued {
            warn!(
                event = "job_failed",
                job_exe.id = job_exe_id,
                job.id = job_id,
                job.error = error_name,
                job.requeued = requeued,
                "Job execution failed, job requeued"
            );
        } else {
            error!(
                event = "job_failed",
                job_exe.id = job_exe_id,
                job.id = job_id,
                job.error = error_name,
                job.requeued = requeued,
                "Job execution failed"
            );
        }
    }

    pub fn log_job_canceled(job_id: i64, job_exe_id: Option<i64>) {
        info!(
            event = "job_canceled",
            job.id = job_id,
            job_exe.id = ?job_exe_id,
            "Job canceled"
        );
    }

    /// Log one round of resource offers
    pub fn log_offers_processed(offers: usize, scheduled: usize, declined: usize, duration_ms: u64) {
        info!(
            event = "offers_processed",
            offers.count = offers,
            offers.scheduled = scheduled,
            offers.declined = declined,
            offers.duration_ms = duration_ms,
            "Resource offers processed"
        );
    }

    pub fn log_node_lost(agent_id: &str, hostname: Option<&str>, running_tasks: usize) {
        warn!(
            event = "node_lost",
            node.agent_id = agent_id,
            node.hostname = hostname.unwrap_or("unknown"),
            node.running_tasks = running_tasks,
            "Node lost"
        );
    }

    pub fn log_node_paused(node_id: i64, hostname: &str, reason: &str) {
        warn!(
            event = "node_paused",
            node.id = node_id,
            node.hostname = hostname,
            node.pause_reason = reason,
            "Node paused"
        );
    }

    pub fn log_tasks_reconciled(requested: usize, remaining: usize) {
        info!(
            event = "task_reconciliation",
            reconciliation.requested = requested,
            reconciliation.remaining = remaining,
            "Task reconciliation requested"
        );
    }
}
