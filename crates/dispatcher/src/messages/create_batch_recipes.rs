//! 分页创建批次配方
//!
//! 每次执行处理一页（至多 `max_recipe_num` 个配方），未处理完时在结果的最前面放一条带游标的后续消息。

use std::collections::BTreeSet;

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{Batch, Data, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CommandContext, CommandMessage, CreateRecipes};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchRecipes {
    pub batch_id: i64,
    /// 上一批次（或数据集）的配方是否已全部处理
    #[serde(default)]
    pub is_prev_batch_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_recipe_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dataset_file_id: Option<i64>,
}

impl CreateBatchRecipes {
    pub fn new(batch_id: i64) -> Self {
        Self {
            batch_id,
            is_prev_batch_done: false,
            current_recipe_id: None,
            current_dataset_file_id: None,
        }
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let page_size = ctx.pipeline.max_recipe_num.max(1);
        let mut tx = ctx.store.begin().await?;
        let mut batch = tx
            .lock_batch(self.batch_id)
            .await?
            .ok_or(OrchestratorError::BatchNotFound { id: self.batch_id })?;

        let mut next = self.clone();
        let mut messages = Vec::new();
        if !next.is_prev_batch_done {
            messages = match batch.superseded_batch_id {
                Some(prev_batch_id) => {
                    next.previous_batch_page(tx.as_mut(), &batch, prev_batch_id, page_size, ctx.max_num())
                        .await?
                }
                None => {
                    next.dataset_page(tx.as_mut(), &batch, page_size, ctx.max_num())
                        .await?
                }
            };
        }

        if next.is_prev_batch_done {
            if !batch.is_creation_done {
                batch.is_creation_done = true;
                batch.updated_at = when;
                tx.update_batch(&batch).await?;
            }
            info!(batch.id = batch.id, "批次配方消息已全部创建");
        } else {
            info!(batch.id = batch.id, "继续创建下一页批次配方");
            messages.insert(0, CommandMessage::CreateBatchRecipes(next));
        }
        tx.commit().await?;
        Ok(messages)
    }

    /// 重新处理上一批次的顶层配方
    async fn previous_batch_page(
        &mut self,
        tx: &mut dyn Transaction,
        batch: &Batch,
        prev_batch_id: i64,
        page_size: usize,
        max_num: usize,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let recipes = tx
            .find_batch_recipes(prev_batch_id, self.current_recipe_id, page_size)
            .await?;
        if let Some(last) = recipes.last() {
            self.current_recipe_id = Some(last.id);
        }
        let root_ids: Vec<i64> = recipes
            .iter()
            .map(|recipe| recipe.root_superseded_recipe_id)
            .collect();
        if recipes.len() < page_size {
            self.is_prev_batch_done = true;
        }
        if !root_ids.is_empty() {
            info!(batch.id = batch.id, count = root_ids.len(), "找到上一批次需要重新处理的配方");
        }
        Ok(CreateRecipes::reprocess_messages(
            &batch.recipe_type_name,
            batch.revision_num,
            &root_ids,
            batch.event_id,
            Some(batch.id),
            batch.definition.forced_nodes.clone(),
            max_num,
        ))
    }

    /// 按文件游标翻页的数据集文件：已有配方的重新处理，其余每个文件创建一个新配方
    async fn dataset_page(
        &mut self,
        tx: &mut dyn Transaction,
        batch: &Batch,
        page_size: usize,
        max_num: usize,
    ) -> OrchestratorResult<Vec<CommandMessage>> {
        let Some(dataset_id) = batch.definition.dataset_id else {
            self.is_prev_batch_done = true;
            return Ok(Vec::new());
        };
        let dataset = tx
            .get_dataset(dataset_id)
            .await?
            .ok_or(OrchestratorError::DatasetNotFound { id: dataset_id })?;
        let revision = tx
            .get_recipe_type_revision(&batch.recipe_type_name, batch.revision_num)
            .await?
            .ok_or_else(|| OrchestratorError::RecipeTypeRevisionNotFound {
                name: batch.recipe_type_name.clone(),
                revision_num: batch.revision_num,
            })?;
        if revision
            .definition
            .input_interface
            .validate_connection(&dataset.parameters)
            .is_err()
        {
            info!(batch.id = batch.id, dataset.id = dataset_id, "数据集参数与配方输入不匹配，不创建配方");
            self.is_prev_batch_done = true;
            return Ok(Vec::new());
        }

        let files = tx
            .find_dataset_files(dataset_id, &[], self.current_dataset_file_id, page_size)
            .await?;
        if let Some(last) = files.last() {
            self.current_dataset_file_id = Some(last.id);
        }
        let page_count = files.len();

        // 只查询本页文件的已有配方
        let mut messages = Vec::new();
        let mut covered: BTreeSet<i64> = BTreeSet::new();
        if batch.definition.supersedes && !files.is_empty() {
            let page_file_ids: Vec<i64> = files.iter().map(|file| file.file_id).collect();
            let existing = tx
                .find_recipes_for_files(batch.recipe_type_id, &page_file_ids, None, usize::MAX)
                .await?;
            let mut root_ids: BTreeSet<i64> = BTreeSet::new();
            for recipe in &existing {
                covered.extend(recipe.input_file_ids.iter().copied());
                // 本批次创建的配方不再重新处理
                if recipe.batch_id != Some(batch.id) {
                    root_ids.insert(recipe.root_superseded_recipe_id);
                }
            }
            if !root_ids.is_empty() {
                info!(batch.id = batch.id, count = root_ids.len(), "数据集文件已有配方，重新处理");
            }
            let root_ids: Vec<i64> = root_ids.into_iter().collect();
            messages.extend(CreateRecipes::reprocess_messages(
                &batch.recipe_type_name,
                batch.revision_num,
                &root_ids,
                batch.event_id,
                Some(batch.id),
                batch.definition.forced_nodes.clone(),
                max_num,
            ));
        }

        let new_files: Vec<_> = files
            .into_iter()
            .filter(|file| !covered.contains(&file.file_id))
            .collect();
        if !new_files.is_empty() {
            info!(batch.id = batch.id, count = new_files.len(), "为没有配方的数据集文件创建配方");
        }
        messages.extend(new_files.into_iter().map(|file| {
            CommandMessage::CreateRecipes(CreateRecipes::new_recipe(
                batch.recipe_type_name.clone(),
                batch.revision_num,
                Data::new().with_files(file.parameter_name, vec![file.file_id]),
                batch.event_id,
                None,
                Some(batch.id),
                batch.definition.forced_nodes.clone(),
            ))
        }));

        if page_count < page_size {
            self.is_prev_batch_done = true;
        }
        Ok(messages)
    }
}
