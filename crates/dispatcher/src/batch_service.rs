//! 批次创建

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::estimate::{
    estimate_recipes, recipes_per_new_root, recipes_per_reprocessed_root,
};
use orchestrator_domain::{
    Batch, BatchConfiguration, BatchCounts, BatchDefinition, NodeType, RecipeDefinition,
    RecipeDiff, RecipeTypeRevision, Store, Transaction,
};
use tracing::{info, instrument};

use crate::messages::{CommandMessage, CreateBatchRecipes};

pub struct BatchService {
    store: Arc<dyn Store>,
}

impl BatchService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 保存新批次并返回第一条 `create_batch_recipes` 消息
    ///
    /// 指定了上一批次时，新批次取代该批次链上最新的批次，并继承链的根。
    #[instrument(skip(self, definition, configuration))]
    pub async fn create_batch(
        &self,
        recipe_type_name: &str,
        definition: BatchDefinition,
        configuration: BatchConfiguration,
        event_id: i64,
    ) -> OrchestratorResult<(Batch, CommandMessage)> {
        definition.validate()?;
        let when = Utc::now();
        let mut tx = self.store.begin().await?;

        let recipe_type = tx.get_recipe_type(recipe_type_name).await?.ok_or_else(|| {
            OrchestratorError::RecipeTypeNotFound {
                name: recipe_type_name.to_string(),
            }
        })?;
        if !recipe_type.is_active {
            return Err(OrchestratorError::InactiveRecipeType(recipe_type_name.to_string()));
        }
        let revision = tx
            .get_recipe_type_revision(recipe_type_name, recipe_type.revision_num)
            .await?
            .ok_or_else(|| OrchestratorError::RecipeTypeRevisionNotFound {
                name: recipe_type_name.to_string(),
                revision_num: recipe_type.revision_num,
            })?;
        let lookup = definition_lookup(tx.as_mut(), &revision.definition).await?;

        let mut definition = definition;
        let mut batch = Batch {
            id: 0,
            title: None,
            recipe_type_id: recipe_type.id,
            recipe_type_name: recipe_type.name.clone(),
            recipe_type_rev_id: revision.id,
            revision_num: revision.revision_num,
            event_id,
            definition: BatchDefinition::default(),
            configuration,
            is_superseded: false,
            superseded_batch_id: None,
            root_batch_id: 0,
            is_creation_done: false,
            recipes_estimated: 0,
            counts: BatchCounts::default(),
            created_at: when,
            updated_at: when,
        };

        if let Some(root_batch_id) = definition.root_batch_id {
            let mut prev = tx
                .get_latest_batch(root_batch_id)
                .await?
                .ok_or(OrchestratorError::BatchNotFound { id: root_batch_id })?;
            if prev.recipe_type_id != recipe_type.id {
                return Err(OrchestratorError::invalid_definition(
                    "MISMATCHED_RECIPE_TYPE",
                    format!("Previous batch {} has a different recipe type", prev.id),
                ));
            }
            if !prev.is_creation_done {
                return Err(OrchestratorError::invalid_definition(
                    "PREV_BATCH_STILL_CREATING",
                    format!("Previous batch {} is still creating recipes", prev.id),
                ));
            }
            let prev_revision = tx
                .get_recipe_type_revision_by_id(prev.recipe_type_rev_id)
                .await?
                .ok_or_else(|| OrchestratorError::RecipeTypeRevisionNotFound {
                    name: prev.recipe_type_name.clone(),
                    revision_num: prev.revision_num,
                })?;
            let mut diff = RecipeDiff::new(&prev_revision.definition, &revision.definition)?;
            if let Some(forced) = definition.forced_nodes.clone() {
                diff.set_force_reprocess(forced);
            }
            let (top_level, _) = tx.count_batch_recipes(prev.id).await?;
            batch.recipes_estimated =
                estimate_recipes(top_level, recipes_per_reprocessed_root(&diff, &lookup));

            definition.prev_batch_id = Some(prev.id);
            batch.superseded_batch_id = Some(prev.id);
            batch.root_batch_id = prev.root_batch_id;
            prev.is_superseded = true;
            prev.updated_at = when;
            tx.update_batch(&prev).await?;
        } else if let Some(dataset_id) = definition.dataset_id {
            tx.get_dataset(dataset_id)
                .await?
                .ok_or(OrchestratorError::DatasetNotFound { id: dataset_id })?;
            let files = tx.count_dataset_files(dataset_id).await?;
            batch.recipes_estimated =
                estimate_recipes(files, recipes_per_new_root(&revision.definition, &lookup));
        }

        batch.definition = definition;
        let batch = tx.create_batch(batch).await?;
        tx.commit().await?;

        info!(
            batch.id = batch.id,
            recipe_type = %batch.recipe_type_name,
            recipes_estimated = batch.recipes_estimated,
            superseded_batch = ?batch.superseded_batch_id,
            "批次已创建"
        );
        let message = CommandMessage::CreateBatchRecipes(CreateBatchRecipes::new(batch.id));
        Ok((batch, message))
    }
}

/// 收集定义中（嵌套）子配方节点引用的全部定义
async fn definition_lookup(
    tx: &mut dyn Transaction,
    definition: &RecipeDefinition,
) -> OrchestratorResult<BTreeMap<(String, i32), RecipeDefinition>> {
    let mut lookup = BTreeMap::new();
    let mut pending: Vec<(String, i32)> = sub_recipe_keys(definition);
    while let Some(key) = pending.pop() {
        if lookup.contains_key(&key) {
            continue;
        }
        let Some(RecipeTypeRevision { definition, .. }) =
            tx.get_recipe_type_revision(&key.0, key.1).await?
        else {
            continue;
        };
        pending.extend(sub_recipe_keys(&definition));
        lookup.insert(key, definition);
    }
    Ok(lookup)
}

fn sub_recipe_keys(definition: &RecipeDefinition) -> Vec<(String, i32)> {
    definition
        .nodes()
        .filter_map(|node| match &node.node_type {
            NodeType::Recipe {
                recipe_type_name,
                revision_num,
            } => Some((recipe_type_name.clone(), *revision_num)),
            NodeType::Job { .. } => None,
        })
        .collect()
}
