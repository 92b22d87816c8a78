mod common;

#[cfg(test)]
mod queue_manager_tests {
    use std::sync::Arc;

    use chrono::Utc;
    use orchestrator_core::{JobResources, OrchestratorError, SchedulerConfig};
    use orchestrator_dispatcher::{ExecutionAssignment, QueueManager};
    use orchestrator_domain::{Data, JobError, JobExecutionStatus, JobStatus, Node};

    use crate::common::{job_type, Harness};

    async fn seed_job_type(harness: &Harness, name: &str, max_tries: i32) {
        let mut tx = harness.tx().await;
        let mut job_type = job_type(name);
        job_type.max_tries = max_tries;
        tx.save_job_type(job_type).await.unwrap();
        tx.commit().await.unwrap();
    }

    async fn seed_node(harness: &Harness, agent_id: &str) -> Node {
        let mut tx = harness.tx().await;
        let node = tx
            .create_node(Node::new(agent_id, format!("{agent_id}.local"), Utc::now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        node
    }

    fn assign(job_exe_id: i64, node_id: i64, resources: JobResources) -> ExecutionAssignment {
        ExecutionAssignment {
            job_exe_id,
            node_id,
            resources,
        }
    }

    #[tokio::test]
    async fn test_queue_new_job_creates_queued_execution() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;

        let job = harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 7, Some(50))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.num_exes, 1);
        assert_eq!(job.priority, 50);
        assert_eq!(job.event_id, 7);

        let queue = harness.queue_manager.get_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].job_id, job.id);
        assert_eq!(queue[0].priority, 50);

        let err = harness
            .queue_manager
            .queue_new_job("missing", "1.0", Data::new(), 7, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobTypeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_queue_is_ordered_by_priority() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;
        seed_job_type(&harness, "detect", 3).await;
        let low = harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, Some(200))
            .await
            .unwrap();
        let high = harness
            .queue_manager
            .queue_new_job("detect", "1.0", Data::new(), 1, Some(10))
            .await
            .unwrap();
        harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, Some(100))
            .await
            .unwrap();

        let queue = harness.queue_manager.get_queue().await.unwrap();
        assert_eq!(queue[0].job_id, high.id);
        assert_eq!(queue[2].job_id, low.id);

        let status = harness.queue_manager.queue_status().await.unwrap();
        assert_eq!(status.len(), 2);
        let ingest = status.iter().find(|s| s.job_type_name == "ingest").unwrap();
        assert_eq!(ingest.count, 2);
        assert_eq!(ingest.highest_priority, 100);
    }

    #[tokio::test]
    async fn test_schedule_with_shortfall_schedules_nothing() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;
        let node = seed_node(&harness, "agent-1").await;
        for _ in 0..2 {
            harness
                .queue_manager
                .queue_new_job("ingest", "1.0", Data::new(), 1, None)
                .await
                .unwrap();
        }
        let queue = harness.queue_manager.get_queue().await.unwrap();

        let err = harness
            .queue_manager
            .schedule_job_executions(
                &[
                    assign(queue[0].job_exe_id, node.id, queue[0].required),
                    assign(queue[1].job_exe_id, node.id, JobResources::new(0.5, 256.0, 10.0, 20.0)),
                ],
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InsufficientResources(_)));

        assert_eq!(harness.queue_manager.get_queue().await.unwrap().len(), 2);
        let mut tx = harness.tx().await;
        let exes = tx
            .get_job_executions(&[queue[0].job_exe_id, queue[1].job_exe_id])
            .await
            .unwrap();
        assert!(exes.iter().all(|exe| exe.status == JobExecutionStatus::Queued));
    }

    #[tokio::test]
    async fn test_schedule_moves_execution_to_running() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;
        let node = seed_node(&harness, "agent-1").await;
        let job = harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, None)
            .await
            .unwrap();
        let entry = harness.queue_manager.get_queue().await.unwrap().remove(0);

        let scheduled = harness
            .queue_manager
            .schedule_job_executions(&[assign(entry.job_exe_id, node.id, entry.required)], Utc::now())
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].job_exe.status, JobExecutionStatus::Running);
        assert_eq!(scheduled[0].job_exe.node_id, Some(node.id));
        assert_eq!(scheduled[0].job_type.name, "ingest");
        assert!(harness.queue_manager.get_queue().await.unwrap().is_empty());

        let mut tx = harness.tx().await;
        let job = tx.get_jobs(&[job.id]).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started.is_some());
    }

    #[tokio::test]
    async fn test_system_failure_is_requeued_until_tries_run_out() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 2).await;
        let node = seed_node(&harness, "agent-1").await;
        let job = harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, None)
            .await
            .unwrap();

        for attempt in 1..=2 {
            let entry = harness.queue_manager.get_queue().await.unwrap().remove(0);
            assert_eq!(entry.exe_num, attempt);
            harness
                .queue_manager
                .schedule_job_executions(&[assign(entry.job_exe_id, node.id, entry.required)], Utc::now())
                .await
                .unwrap();
            harness
                .queue_manager
                .handle_job_failure(entry.job_exe_id, Utc::now(), JobError::node_lost())
                .await
                .unwrap();
        }

        assert!(harness.queue_manager.get_queue().await.unwrap().is_empty());
        let mut tx = harness.tx().await;
        let job = tx.get_jobs(&[job.id]).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.num_exes, 2);
        assert_eq!(job.error.map(|e| e.name), Some("node-lost".to_string()));
        drop(tx);

        // 重新排队获得新一轮重试次数
        harness
            .queue_manager
            .requeue_jobs(&[job.id], Some(5))
            .await
            .unwrap();
        let mut tx = harness.tx().await;
        let job = tx.get_jobs(&[job.id]).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.num_exes, 3);
        assert_eq!(job.max_tries, 4);
        assert_eq!(job.priority, 5);
    }

    #[tokio::test]
    async fn test_system_failure_without_input_is_not_left_running() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;
        let node = seed_node(&harness, "agent-1").await;
        let job = harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, None)
            .await
            .unwrap();
        let entry = harness.queue_manager.get_queue().await.unwrap().remove(0);
        harness
            .queue_manager
            .schedule_job_executions(&[assign(entry.job_exe_id, node.id, entry.required)], Utc::now())
            .await
            .unwrap();

        // 没有输入的作业不能重新排队
        let mut tx = harness.tx().await;
        let mut running = tx.get_jobs(&[job.id]).await.unwrap().remove(0);
        running.input = None;
        tx.update_job(&running).await.unwrap();
        tx.commit().await.unwrap();

        harness
            .queue_manager
            .handle_job_failure(entry.job_exe_id, Utc::now(), JobError::node_lost())
            .await
            .unwrap();

        assert!(harness.queue_manager.get_queue().await.unwrap().is_empty());
        let mut tx = harness.tx().await;
        let job = tx.get_jobs(&[job.id]).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.num_exes, 1);
        assert_eq!(job.error.map(|e| e.name), Some("node-lost".to_string()));
        let exe = tx.get_job_executions(&[entry.job_exe_id]).await.unwrap().remove(0);
        assert_eq!(exe.status, JobExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_completion_ignored_for_execution_not_running() {
        let harness = Harness::new();
        seed_job_type(&harness, "ingest", 3).await;
        harness
            .queue_manager
            .queue_new_job("ingest", "1.0", Data::new(), 1, None)
            .await
            .unwrap();
        let entry = harness.queue_manager.get_queue().await.unwrap().remove(0);

        let messages = harness
            .queue_manager
            .handle_job_completion(entry.job_exe_id, Utc::now(), None)
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert_eq!(harness.queue_manager.get_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_system_failures_pause_node() {
        let harness = Harness::new();
        let queue_manager = Arc::new(QueueManager::new(
            harness.store.clone(),
            SchedulerConfig {
                max_node_errors: 2,
                node_error_period_minutes: 10,
                ..SchedulerConfig::default()
            },
            harness.metrics.clone(),
        ));
        seed_job_type(&harness, "ingest", 1).await;
        let node = seed_node(&harness, "agent-1").await;

        for _ in 0..2 {
            queue_manager
                .queue_new_job("ingest", "1.0", Data::new(), 1, None)
                .await
                .unwrap();
        }
        let queue = queue_manager.get_queue().await.unwrap();
        let assignments: Vec<_> = queue
            .iter()
            .map(|entry| assign(entry.job_exe_id, node.id, entry.required))
            .collect();
        queue_manager
            .schedule_job_executions(&assignments, Utc::now())
            .await
            .unwrap();

        queue_manager
            .handle_job_failure(queue[0].job_exe_id, Utc::now(), JobError::node_lost())
            .await
            .unwrap();
        let mut tx = harness.tx().await;
        assert!(!tx.get_node_by_agent("agent-1").await.unwrap().unwrap().is_paused_errors);
        drop(tx);

        queue_manager
            .handle_job_failure(queue[1].job_exe_id, Utc::now(), JobError::node_lost())
            .await
            .unwrap();
        let mut tx = harness.tx().await;
        let node = tx.get_node_by_agent("agent-1").await.unwrap().unwrap();
        assert!(node.is_paused_errors);
        assert!(node.pause_reason.is_some());
    }
}
