mod common;

#[cfg(test)]
mod recipe_pipeline_tests {
    use chrono::Utc;
    use orchestrator_dispatcher::messages::CreateRecipes;
    use orchestrator_dispatcher::CommandMessage;
    use orchestrator_domain::{Data, JobError, JobStatus, Recipe};

    use crate::common::{diamond_definition, seed_recipe_type, Harness};

    fn new_recipe(file_id: i64) -> CommandMessage {
        CommandMessage::CreateRecipes(CreateRecipes::new_recipe(
            "diamond",
            1,
            Data::new().with_files("INPUT", vec![file_id]),
            1,
            None,
            None,
            None,
        ))
    }

    async fn recipe_for_file(harness: &Harness, recipe_type_id: i64, file_id: i64) -> Recipe {
        let mut tx = harness.tx().await;
        let mut recipes = tx
            .find_recipes_for_files(recipe_type_id, &[file_id], None, 10)
            .await
            .unwrap();
        assert_eq!(recipes.len(), 1);
        recipes.remove(0)
    }

    fn statuses(jobs: &[(String, orchestrator_domain::Job)]) -> Vec<(&str, JobStatus)> {
        jobs.iter()
            .map(|(name, job)| (name.as_str(), job.status))
            .collect()
    }

    #[tokio::test]
    async fn test_new_recipe_creates_all_jobs_and_queues_roots() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;

        harness.run(&[new_recipe(11)]).await;

        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 11).await;
        assert!(recipe.is_input_processed);
        assert_eq!(recipe.root_superseded_recipe_id, recipe.id);

        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(
            statuses(&jobs),
            vec![
                ("a", JobStatus::Queued),
                ("b", JobStatus::Pending),
                ("c", JobStatus::Pending),
                ("d", JobStatus::Pending),
            ]
        );
        assert_eq!(harness.queue_manager.get_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_propagates_through_diamond() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        harness.run(&[new_recipe(12)]).await;
        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 12).await;

        assert_eq!(harness.complete_queued().await.len(), 1);
        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(
            statuses(&jobs),
            vec![
                ("a", JobStatus::Completed),
                ("b", JobStatus::Queued),
                ("c", JobStatus::Queued),
                ("d", JobStatus::Pending),
            ]
        );

        // d 要等 b 和 c 都完成
        assert_eq!(harness.complete_queued().await.len(), 2);
        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(jobs[3].1.status, JobStatus::Queued);
        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 12).await;
        assert!(!recipe.is_completed);

        assert_eq!(harness.complete_queued().await.len(), 1);
        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 12).await;
        assert!(recipe.is_completed);
        assert_eq!(recipe.counts.jobs_completed, 4);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_and_requeue_unblocks() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        harness.run(&[new_recipe(13)]).await;
        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 13).await;

        let entry = harness.queue_manager.get_queue().await.unwrap().remove(0);
        harness
            .queue_manager
            .schedule_job_executions(
                &[orchestrator_dispatcher::ExecutionAssignment {
                    job_exe_id: entry.job_exe_id,
                    node_id: 1,
                    resources: entry.required,
                }],
                Utc::now(),
            )
            .await
            .unwrap();
        // 算法错误不自动重试
        let messages = harness
            .queue_manager
            .handle_job_failure(entry.job_exe_id, Utc::now(), JobError::timeout())
            .await
            .unwrap();
        harness.run(&messages).await;

        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(
            statuses(&jobs),
            vec![
                ("a", JobStatus::Failed),
                ("b", JobStatus::Blocked),
                ("c", JobStatus::Blocked),
                ("d", JobStatus::Blocked),
            ]
        );

        let messages = harness
            .queue_manager
            .requeue_jobs(&[entry.job_id], None)
            .await
            .unwrap();
        harness.run(&messages).await;

        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(
            statuses(&jobs),
            vec![
                ("a", JobStatus::Queued),
                ("b", JobStatus::Pending),
                ("c", JobStatus::Pending),
                ("d", JobStatus::Pending),
            ]
        );
        assert_eq!(jobs[0].1.num_exes, 2);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_removes_queue_entry() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        harness.run(&[new_recipe(14)]).await;
        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 14).await;
        let job_a = harness.jobs_by_node(recipe.id).await.remove(0).1;

        let messages = harness
            .queue_manager
            .handle_job_cancellation(job_a.id, Utc::now())
            .await
            .unwrap();
        harness.run(&messages).await;

        assert!(harness.queue_manager.get_queue().await.unwrap().is_empty());
        let jobs = harness.jobs_by_node(recipe.id).await;
        assert_eq!(jobs[0].1.status, JobStatus::Canceled);
        assert!(jobs[1..]
            .iter()
            .all(|(_, job)| job.status == JobStatus::Blocked));

        // 已取消的作业不能再次取消
        assert!(harness
            .queue_manager
            .handle_job_cancellation(job_a.id, Utc::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_replayed_create_recipes_does_not_duplicate() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let command = new_recipe(15);

        let first = command.execute(&harness.ctx).await.unwrap();
        let second = command.execute(&harness.ctx).await.unwrap();
        assert_eq!(first, second);

        let recipe = recipe_for_file(&harness, revision.recipe_type_id, 15).await;
        assert_eq!(
            first,
            vec![CommandMessage::ProcessRecipeInput(
                orchestrator_dispatcher::messages::ProcessRecipeInput {
                    recipe_ids: vec![recipe.id],
                    forced_nodes: None,
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_inactive_recipe_type_creates_nothing() {
        let harness = Harness::new();
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        {
            let mut tx = harness.tx().await;
            let mut recipe_type = tx.get_recipe_type("diamond").await.unwrap().unwrap();
            recipe_type.is_active = false;
            tx.save_recipe_type(recipe_type).await.unwrap();
            tx.commit().await.unwrap();
        }

        let messages = new_recipe(16).execute(&harness.ctx).await.unwrap();
        assert!(messages.is_empty());
        let mut tx = harness.tx().await;
        assert!(tx
            .find_recipes_for_files(revision.recipe_type_id, &[16], None, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
