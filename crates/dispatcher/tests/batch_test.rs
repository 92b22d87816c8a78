mod common;

#[cfg(test)]
mod batch_tests {
    use std::collections::BTreeSet;

    use orchestrator_core::{OrchestratorError, PipelineConfig};
    use orchestrator_dispatcher::messages::{CreateRecipes, CreateRecipesKind};
    use orchestrator_dispatcher::{BatchService, CommandMessage};
    use orchestrator_domain::{Batch, BatchConfiguration, BatchDefinition, Data};

    use crate::common::{
        chain_definition, diamond_definition, diamond_definition_with_c_revision,
        inner_definition, seed_dataset, seed_recipe_type, Harness,
    };

    const FILES: [i64; 6] = [101, 102, 103, 104, 105, 106];

    fn harness() -> Harness {
        harness_with_page_size(5)
    }

    fn harness_with_page_size(max_recipe_num: usize) -> Harness {
        Harness::with_pipeline(PipelineConfig {
            max_recipe_num,
            ..PipelineConfig::default()
        })
    }

    async fn create_batch(
        harness: &Harness,
        definition: BatchDefinition,
        event_id: i64,
    ) -> (Batch, CommandMessage) {
        create_batch_of(harness, "diamond", definition, event_id).await
    }

    async fn create_batch_of(
        harness: &Harness,
        recipe_type: &str,
        definition: BatchDefinition,
        event_id: i64,
    ) -> (Batch, CommandMessage) {
        BatchService::new(harness.store.clone())
            .create_batch(recipe_type, definition, BatchConfiguration::default(), event_id)
            .await
            .unwrap()
    }

    /// 依次执行续页消息直到没有下一页，返回所有页产生的配方消息
    async fn drain_pages(harness: &Harness, first: CommandMessage) -> Vec<CommandMessage> {
        let mut next = Some(first);
        let mut recipe_messages = Vec::new();
        let mut pages = 0;
        while let Some(message) = next.take() {
            pages += 1;
            assert!(pages <= FILES.len() + 2, "批次翻页没有结束");
            for output in message.execute(&harness.ctx).await.unwrap() {
                match output {
                    CommandMessage::CreateBatchRecipes(_) => next = Some(output),
                    other => recipe_messages.push(other),
                }
            }
        }
        recipe_messages
    }

    async fn load_batch(harness: &Harness, batch_id: i64) -> Batch {
        harness.tx().await.get_batch(batch_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_dataset_batch_is_created_in_pages() {
        let harness = harness();
        seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let dataset = seed_dataset(&harness, &[101, 102, 103, 104, 105, 106]).await;

        let (batch, message) =
            create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 1).await;
        assert_eq!(batch.recipes_estimated, 6);
        assert_eq!(batch.root_batch_id, batch.id);
        assert!(!batch.is_creation_done);

        // 第一页：续页消息在最前，后面是五个新配方
        let first_page = message.execute(&harness.ctx).await.unwrap();
        assert_eq!(first_page.len(), 6);
        assert!(matches!(first_page[0], CommandMessage::CreateBatchRecipes(_)));
        assert!(first_page[1..]
            .iter()
            .all(|message| matches!(message, CommandMessage::CreateRecipes(_))));

        let second_page = first_page[0].execute(&harness.ctx).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert!(matches!(second_page[0], CommandMessage::CreateRecipes(_)));
        assert!(load_batch(&harness, batch.id).await.is_creation_done);
    }

    #[tokio::test]
    async fn test_dataset_batch_creates_one_recipe_per_file() {
        let harness = harness();
        seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let dataset = seed_dataset(&harness, &[101, 102, 103, 104, 105, 106]).await;
        let (batch, message) =
            create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 1).await;

        harness.run(&[message]).await;

        let mut tx = harness.tx().await;
        assert_eq!(tx.count_batch_recipes(batch.id).await.unwrap(), (6, 0));
        let recipes = tx.find_batch_recipes(batch.id, None, 100).await.unwrap();
        assert_eq!(recipes.len(), 6);
        assert!(recipes.iter().all(|recipe| recipe.is_input_processed));
        drop(tx);

        // 每个配方的根节点都已排队
        assert_eq!(harness.queue_manager.get_queue().await.unwrap().len(), 6);
        assert_eq!(load_batch(&harness, batch.id).await.counts.recipes_total, 6);
    }

    #[tokio::test]
    async fn test_previous_batch_reprocesses_its_recipes() {
        let harness = harness();
        seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let dataset = seed_dataset(&harness, &[101, 102, 103, 104, 105, 106]).await;
        let (first, message) =
            create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 1).await;
        harness.run(&[message]).await;

        let (second, message) =
            create_batch(&harness, BatchDefinition::for_previous_batch(first.id), 2).await;
        assert_eq!(second.recipes_estimated, 6);
        assert_eq!(second.superseded_batch_id, Some(first.id));
        assert_eq!(second.root_batch_id, first.id);
        assert_eq!(second.definition.prev_batch_id, Some(first.id));
        assert!(load_batch(&harness, first.id).await.is_superseded);

        harness.run(&[message]).await;

        let mut tx = harness.tx().await;
        let latest = tx
            .find_recipes_for_files(
                first.recipe_type_id,
                &[101, 102, 103, 104, 105, 106],
                None,
                100,
            )
            .await
            .unwrap();
        assert_eq!(latest.len(), 6);
        assert!(latest
            .iter()
            .all(|recipe| recipe.batch_id == Some(second.id) && recipe.superseded_recipe_id.is_some()));
        assert_eq!(tx.count_batch_recipes(second.id).await.unwrap(), (6, 0));
        assert!(tx.get_batch(second.id).await.unwrap().unwrap().is_creation_done);
    }

    #[tokio::test]
    async fn test_previous_batch_must_finish_creating() {
        let harness = harness();
        seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let dataset = seed_dataset(&harness, &[101, 102]).await;
        let (first, _) = create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 1).await;

        let err = BatchService::new(harness.store.clone())
            .create_batch(
                "diamond",
                BatchDefinition::for_previous_batch(first.id),
                BatchConfiguration::default(),
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidDefinition { ref code, .. } if code == "PREV_BATCH_STILL_CREATING"
        ));
        assert!(!load_batch(&harness, first.id).await.is_superseded);
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_rejected() {
        let harness = harness();
        seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;

        let err = BatchService::new(harness.store.clone())
            .create_batch(
                "diamond",
                BatchDefinition::for_dataset(42),
                BatchConfiguration::default(),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DatasetNotFound { id: 42 }));
    }

    #[tokio::test]
    async fn test_dataset_batch_pages_cover_every_file_for_any_page_size() {
        for page_size in 1..=7 {
            let harness = harness_with_page_size(page_size);
            seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
            let dataset = seed_dataset(&harness, &FILES).await;
            let (batch, message) =
                create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 1).await;

            let recipe_messages = drain_pages(&harness, message).await;
            assert_eq!(recipe_messages.len(), FILES.len(), "page_size = {page_size}");
            assert!(load_batch(&harness, batch.id).await.is_creation_done);
            harness.run(&recipe_messages).await;

            let mut tx = harness.tx().await;
            let recipes = tx.find_batch_recipes(batch.id, None, 100).await.unwrap();
            let files: BTreeSet<i64> = recipes
                .iter()
                .flat_map(|recipe| recipe.input_file_ids.iter().copied())
                .collect();
            assert_eq!(recipes.len(), FILES.len(), "page_size = {page_size}");
            assert_eq!(files, BTreeSet::from(FILES));
        }
    }

    #[tokio::test]
    async fn test_dataset_batch_with_sub_recipe_node() {
        let harness = harness();
        seed_recipe_type(&harness, "inner", 1, inner_definition()).await;
        seed_recipe_type(&harness, "chain", 1, chain_definition()).await;
        let dataset = seed_dataset(&harness, &FILES).await;

        let (batch, message) =
            create_batch_of(&harness, "chain", BatchDefinition::for_dataset(dataset.id), 1).await;
        // 每个文件一个顶层配方加一个子配方
        assert_eq!(batch.recipes_estimated, 12);

        let first_page = message.execute(&harness.ctx).await.unwrap();
        assert_eq!(first_page.len(), 6);
        assert!(matches!(first_page[0], CommandMessage::CreateBatchRecipes(_)));
        let second_page = first_page[0].execute(&harness.ctx).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert!(load_batch(&harness, batch.id).await.is_creation_done);

        harness.run(&first_page[1..]).await;
        harness.run(&second_page).await;

        // 重新投递已处理过的配方消息不产生重复配方
        let replayed: Vec<CommandMessage> = first_page[1..]
            .iter()
            .map(|message| CommandMessage::from_json(message.to_json().unwrap()).unwrap())
            .collect();
        harness.run(&replayed).await;

        let recipes = {
            let mut tx = harness.tx().await;
            assert_eq!(tx.count_batch_recipes(batch.id).await.unwrap(), (6, 0));
            tx.find_batch_recipes(batch.id, None, 100).await.unwrap()
        };
        assert_eq!(recipes.len(), 6);
        for recipe in &recipes {
            let sub = harness.sub_recipe(recipe.id, "node_e").await;
            assert_eq!(sub.recipe_id, Some(recipe.id));
            assert!(!sub.is_input_processed);
        }
        // 只有每个配方的 node_c 排队
        assert_eq!(harness.queue_manager.get_queue().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_dataset_batch_reprocesses_existing_recipes_page_by_page() {
        let harness = harness_with_page_size(4);
        let revision = seed_recipe_type(&harness, "diamond", 1, diamond_definition()).await;
        let dataset = seed_dataset(&harness, &FILES).await;

        // 最早的两个文件已经有批次之外的配方
        let existing: Vec<CommandMessage> = [101, 102]
            .into_iter()
            .map(|file_id| {
                CommandMessage::CreateRecipes(CreateRecipes::new_recipe(
                    "diamond",
                    1,
                    Data::new().with_files("INPUT", vec![file_id]),
                    1,
                    None,
                    None,
                    None,
                ))
            })
            .collect();
        harness.run(&existing).await;
        let old_roots: BTreeSet<i64> = harness
            .tx()
            .await
            .find_recipes_for_files(revision.recipe_type_id, &[101, 102], None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|recipe| recipe.root_superseded_recipe_id)
            .collect();
        assert_eq!(old_roots.len(), 2);

        seed_recipe_type(&harness, "diamond", 2, diamond_definition_with_c_revision(2)).await;
        let (batch, message) =
            create_batch(&harness, BatchDefinition::for_dataset(dataset.id), 2).await;
        assert_eq!(batch.revision_num, 2);

        // 文件按加入数据集的倒序翻页：第一页 106..103 都没有配方
        let first_page = message.execute(&harness.ctx).await.unwrap();
        assert_eq!(first_page.len(), 5);
        let CommandMessage::CreateBatchRecipes(next) = &first_page[0] else {
            panic!("expected continuation first");
        };
        assert!(next.current_dataset_file_id.is_some());
        assert!(!next.is_prev_batch_done);

        // 第二页 102、101 已有配方，合并为一条重新处理消息
        let second_page = first_page[0].execute(&harness.ctx).await.unwrap();
        assert_eq!(second_page.len(), 1);
        let CommandMessage::CreateRecipes(CreateRecipes {
            kind: CreateRecipesKind::Reprocess { root_recipe_ids, .. },
            batch_id,
            ..
        }) = &second_page[0]
        else {
            panic!("expected reprocess message");
        };
        assert_eq!(*batch_id, Some(batch.id));
        assert_eq!(root_recipe_ids.iter().copied().collect::<BTreeSet<_>>(), old_roots);
        assert!(load_batch(&harness, batch.id).await.is_creation_done);

        harness.run(&first_page[1..]).await;
        harness.run(&second_page).await;

        let mut tx = harness.tx().await;
        let latest = tx
            .find_recipes_for_files(revision.recipe_type_id, &FILES, None, 100)
            .await
            .unwrap();
        assert_eq!(latest.len(), 6);
        assert!(latest.iter().all(|recipe| recipe.batch_id == Some(batch.id)));
        let superseding: BTreeSet<i64> = latest
            .iter()
            .filter(|recipe| recipe.superseded_recipe_id.is_some())
            .map(|recipe| recipe.root_superseded_recipe_id)
            .collect();
        assert_eq!(superseding, old_roots);
        assert_eq!(tx.count_batch_recipes(batch.id).await.unwrap(), (6, 0));
    }
}
