#[cfg(test)]
mod running_job_execution_tests {
    use chrono::{Duration, Utc};
    use orchestrator_core::{JobResources, TaskState, TaskStatusUpdate, TaskTimeoutConfig};
    use orchestrator_domain::entities::{
        JobExecution, JobExecutionStatus, JobInterface, JobType,
    };
    use orchestrator_worker::{ExecutionOutcome, ExecutionStatus, RunningJobExecution, TaskKind};

    fn job_type(is_system: bool) -> JobType {
        JobType {
            id: 3,
            name: "detector".to_string(),
            version: "1.0".to_string(),
            revision_num: 1,
            is_active: true,
            is_paused: false,
            is_system,
            is_long_running: false,
            max_tries: 3,
            priority: 100,
            timeout_seconds: 600,
            resources: JobResources::new(1.0, 256.0, 10.0, 20.0),
            interface: JobInterface::default(),
            created_at: Utc::now(),
        }
    }

    fn job_exe() -> JobExecution {
        JobExecution {
            id: 42,
            job_id: 7,
            job_type_id: 3,
            exe_num: 1,
            status: JobExecutionStatus::Running,
            node_id: Some(1),
            resources: JobResources::new(1.0, 256.0, 10.0, 20.0),
            error: None,
            exit_code: None,
            queued: Utc::now(),
            started: Some(Utc::now()),
            ended: None,
        }
    }

    fn running(is_system: bool) -> RunningJobExecution {
        RunningJobExecution::new(
            "agent-1",
            &job_exe(),
            &job_type(is_system),
            &TaskTimeoutConfig::default(),
            100,
        )
    }

    fn update(task_id: &str, state: TaskState) -> TaskStatusUpdate {
        TaskStatusUpdate::new(task_id, state, Utc::now())
    }

    /// 运行当前任务直到 FINISHED
    fn finish_current(exe: &mut RunningJobExecution) -> Option<ExecutionOutcome> {
        let launch = exe.start_next_task(Utc::now()).unwrap();
        assert!(exe.task_update(&update(&launch.task_id, TaskState::Running)).is_none());
        exe.task_update(&update(&launch.task_id, TaskState::Finished))
    }

    #[test]
    fn test_all_tasks_complete_in_order() {
        let mut exe = running(false);
        let kinds: Vec<TaskKind> = exe.tasks().iter().map(|task| task.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::Pull, TaskKind::Pre, TaskKind::Main, TaskKind::Post]
        );

        for _ in 0..3 {
            assert!(exe.is_next_task_ready());
            assert!(finish_current(&mut exe).is_none());
            assert_eq!(exe.status(), ExecutionStatus::Running);
        }
        let outcome = finish_current(&mut exe);
        assert!(matches!(outcome, Some(ExecutionOutcome::Completed { .. })));
        assert_eq!(exe.status(), ExecutionStatus::Completed);
        assert!(exe.is_finished());
    }

    #[test]
    fn test_system_job_runs_main_only() {
        let mut exe = running(true);
        assert_eq!(exe.tasks().len(), 1);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        assert_eq!(launch.task_id, "42_main");
        assert!(exe.start_next_task(Utc::now()).is_none());
    }

    #[test]
    fn test_timeout_is_failed_but_not_finished_until_killed() {
        let mut exe = running(false);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        exe.task_update(&update(&launch.task_id, TaskState::Running));

        let outcome = exe.execution_timed_out(Utc::now());
        match outcome {
            Some(ExecutionOutcome::Failed { error, .. }) => assert_eq!(error.name, "pull-timeout"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(exe.status(), ExecutionStatus::Failed);
        assert!(!exe.is_finished());

        // 重复的超时不会改变状态
        assert!(exe.execution_timed_out(Utc::now()).is_none());

        assert!(exe.task_update(&update(&launch.task_id, TaskState::Killed)).is_none());
        assert!(exe.is_finished());
        assert_eq!(exe.error().unwrap().name, "pull-timeout");
    }

    #[test]
    fn test_check_timeout_flags_kill() {
        let mut exe = running(false);
        let start = Utc::now();
        let launch = exe.start_next_task(start).unwrap();
        assert!(exe.check_timeout(start + Duration::seconds(30)).is_none());
        assert!(exe.check_timeout(start + Duration::minutes(5)).is_some());
        assert_eq!(
            exe.task_to_kill(),
            Some((launch.task_id.clone(), "agent-1".to_string()))
        );
        assert!(!exe.is_finished());
    }

    #[test]
    fn test_node_lost_waits_for_lost_update() {
        let mut exe = running(false);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        exe.task_update(&update(&launch.task_id, TaskState::Running));

        let outcome = exe.execution_lost(Utc::now());
        match outcome {
            Some(ExecutionOutcome::Failed { error, .. }) => assert_eq!(error.name, "node-lost"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!exe.is_finished());
        assert!(exe.needs_reconciliation(Utc::now()).is_some());

        exe.task_update(&update(&launch.task_id, TaskState::Lost));
        assert!(exe.is_finished());
        assert_eq!(exe.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn test_task_lost_before_start_is_relaunched_with_new_id() {
        let mut exe = running(false);
        let first = exe.start_next_task(Utc::now()).unwrap();
        assert_eq!(first.task_id, "42_pull");

        assert!(exe.task_update(&update("42_pull", TaskState::Lost)).is_none());
        assert_eq!(exe.status(), ExecutionStatus::Running);
        assert!(exe.is_next_task_ready());

        let second = exe.start_next_task(Utc::now()).unwrap();
        assert_eq!(second.task_id, "42_pull_1");
        // 旧 ID 的回报被忽略
        assert!(exe.task_update(&update("42_pull", TaskState::Failed)).is_none());
        assert_eq!(exe.status(), ExecutionStatus::Running);
    }

    #[test]
    fn test_task_lost_after_start_fails_execution() {
        let mut exe = running(false);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        exe.task_update(&update(&launch.task_id, TaskState::Running));
        let outcome = exe.task_update(&update(&launch.task_id, TaskState::Lost));
        assert!(matches!(outcome, Some(ExecutionOutcome::Failed { .. })));
        assert!(exe.is_finished());
    }

    #[test]
    fn test_launch_failure_is_system_error() {
        let mut exe = running(false);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        let outcome = exe.task_update(&update(&launch.task_id, TaskState::Failed));
        match outcome {
            Some(ExecutionOutcome::Failed { error, .. }) => {
                assert_eq!(error.name, "docker-task-launch");
                assert!(error.is_system());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(exe.is_finished());
        assert!(exe.next_task().is_none());
    }

    #[test]
    fn test_cancel_kills_current_task() {
        let mut exe = running(false);
        let launch = exe.start_next_task(Utc::now()).unwrap();
        exe.execution_canceled(Utc::now());
        assert_eq!(exe.status(), ExecutionStatus::Canceled);
        assert_eq!(exe.task_to_kill().map(|(id, _)| id), Some(launch.task_id.clone()));
        assert!(!exe.is_finished());

        exe.task_update(&update(&launch.task_id, TaskState::Killed));
        assert!(exe.is_finished());
        assert_eq!(exe.status(), ExecutionStatus::Canceled);
    }
}
