//! 编排器指标
//!
//! 基于 `metrics` crate 的计数器、仪表和直方图。未安装 recorder 时
//! 所有记录操作都是空操作，测试中可以直接使用。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// Metrics collector for the orchestrator
#[derive(Clone)]
pub struct MetricsCollector {
    // Pipeline metrics
    messages_processed_total: Counter,
    message_failures_total: Counter,
    message_duration: Histogram,
    recipes_created_total: Counter,
    nodes_superseded_total: Counter,

    // Queue metrics
    jobs_queued_total: Counter,
    job_failures_total: Counter,
    job_completions_total: Counter,
    job_cancellations_total: Counter,
    queue_depth: Gauge,

    // Scheduler metrics
    job_executions_scheduled_total: Counter,
    running_executions: Gauge,
    offers_received_total: Counter,
    offers_declined_total: Counter,
    offer_processing_duration: Histogram,
    nodes_lost_total: Counter,
    tasks_reconciled_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_processed_total: counter!("orchestrator_messages_processed_total"),
            message_failures_total: counter!("orchestrator_message_failures_total"),
            message_duration: histogram!("orchestrator_message_duration_seconds"),
            recipes_created_total: counter!("orchestrator_recipes_created_total"),
            nodes_superseded_total: counter!("orchestrator_nodes_superseded_total"),
            jobs_queued_total: counter!("orchestrator_jobs_queued_total"),
            job_failures_total: counter!("orchestrator_job_failures_total"),
            job_completions_total: counter!("orchestrator_job_completions_total"),
            job_cancellations_total: counter!("orchestrator_job_cancellations_total"),
            queue_depth: gauge!("orchestrator_queue_depth"),
            job_executions_scheduled_total: counter!(
                "orchestrator_job_executions_scheduled_total"
            ),
            running_executions: gauge!("orchestrator_running_executions"),
            offers_received_total: counter!("orchestrator_offers_received_total"),
            offers_declined_total: counter!("orchestrator_offers_declined_total"),
            offer_processing_duration: histogram!(
                "orchestrator_offer_processing_duration_seconds"
            ),
            nodes_lost_total: counter!("orchestrator_nodes_lost_total"),
            tasks_reconciled_total: counter!("orchestrator_tasks_reconciled_total"),
        }
    }

    // Pipeline metrics

    /// 记录一条命令消息的处理结果
    pub fn record_message(&self, message_type: &str, success: bool, duration_seconds: f64) {
        self.messages_processed_total.increment(1);
        self.message_duration.record(duration_seconds);
        if !success {
            self.message_failures_total.increment(1);
        }
        debug!(
            message_type,
            success, duration_seconds, "Message processing recorded"
        );
    }

    pub fn record_recipes_created(&self, count: usize) {
        self.recipes_created_total.increment(count as u64);
    }

    pub fn record_nodes_superseded(&self, count: usize) {
        self.nodes_superseded_total.increment(count as u64);
    }

    // Queue metrics

    pub fn record_jobs_queued(&self, count: usize) {
        self.jobs_queued_total.increment(count as u64);
    }

    pub fn record_job_completed(&self) {
        self.job_completions_total.increment(1);
    }

    pub fn record_job_failed(&self, error_name: &str) {
        self.job_failures_total.increment(1);
        debug!(error_name, "Job failure recorded");
    }

    pub fn record_job_canceled(&self) {
        self.job_cancellations_total.increment(1);
    }

    pub fn update_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    // Scheduler metrics

    pub fn record_executions_scheduled(&self, count: usize) {
        self.job_executions_scheduled_total.increment(count as u64);
    }

    pub fn update_running_executions(&self, count: usize) {
        self.running_executions.set(count as f64);
    }

    /// 记录一轮 offer 处理
    pub fn record_offer_round(&self, received: usize, declined: usize, duration_seconds: f64) {
        self.offers_received_total.increment(received as u64);
        self.offers_declined_total.increment(declined as u64);
        self.offer_processing_duration.record(duration_seconds);
    }

    pub fn record_node_lost(&self) {
        self.nodes_lost_total.increment(1);
    }

    pub fn record_tasks_reconciled(&self, count: usize) {
        self.tasks_reconciled_total.increment(count as u64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
