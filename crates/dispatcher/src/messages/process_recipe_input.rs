//! 处理配方输入
//!
//! 没有输入的子配方从父配方的定义生成输入；处理完成后更新配方。

use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::store::load_recipe_instance;
use orchestrator_domain::{Data, ForcedNodes};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{CommandContext, CommandMessage, UpdateRecipe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecipeInput {
    pub recipe_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_nodes: Option<ForcedNodes>,
}

impl ProcessRecipeInput {
    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let mut tx = ctx.store.begin().await?;
        let mut messages = Vec::new();

        for recipe in tx.lock_recipes(&self.recipe_ids).await? {
            let mut recipe = recipe;
            if !recipe.has_input() {
                let Some(parent_id) = recipe.recipe_id else {
                    error!(recipe.id = recipe.id, "顶层配方没有输入");
                    continue;
                };
                let Some(parent_node) = tx.get_parent_node(recipe.id).await? else {
                    error!(recipe.id = recipe.id, "子配方没有父节点");
                    continue;
                };
                let parent = tx
                    .get_recipes(&[parent_id])
                    .await?
                    .pop()
                    .ok_or(OrchestratorError::RecipeNotFound { id: parent_id })?;
                let (revision, instance) = load_recipe_instance(tx.as_mut(), parent).await?;
                let parent_input = instance.recipe.input.clone().unwrap_or_else(Data::new);
                match revision.definition.generate_node_input_data(
                    &parent_node.node_name,
                    &parent_input,
                    &instance.node_outputs(),
                ) {
                    Ok(input) => recipe = recipe.with_input(input),
                    Err(e @ OrchestratorError::InvalidData { .. }) => {
                        error!(recipe.id = recipe.id, error = %e, "子配方输入无效");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            recipe.is_input_processed = true;
            recipe.updated_at = when;
            tx.update_recipe(&recipe).await?;
            messages.push(CommandMessage::UpdateRecipe(UpdateRecipe::new(
                recipe.root_superseded_recipe_id,
                self.forced_nodes.clone(),
            )));
        }
        tx.commit().await?;

        debug!(count = messages.len(), "配方输入已处理");
        Ok(messages)
    }
}
