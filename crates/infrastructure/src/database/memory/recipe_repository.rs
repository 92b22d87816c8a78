use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{
    Recipe, RecipeNode, RecipeNodeCopy, RecipeType, RecipeTypeRevision,
};
use orchestrator_domain::interface::Data;
use orchestrator_domain::store::RecipeRepository;
use tracing::{debug, instrument};

use super::{next_id, rows_by_ids, InMemoryTransaction};

#[async_trait]
impl RecipeRepository for InMemoryTransaction {
    async fn save_recipe_type(&mut self, mut recipe_type: RecipeType) -> OrchestratorResult<RecipeType> {
        let state = &mut self.working;
        if recipe_type.id == 0 {
            recipe_type.id = match state.recipe_types.get(&recipe_type.name) {
                Some(existing) => existing.id,
                None => next_id(&mut state.sequences.recipe_type),
            };
        }
        state
            .recipe_types
            .insert(recipe_type.name.clone(), recipe_type.clone());
        Ok(recipe_type)
    }

    async fn get_recipe_type(&mut self, name: &str) -> OrchestratorResult<Option<RecipeType>> {
        Ok(self.working.recipe_types.get(name).cloned())
    }

    async fn save_recipe_type_revision(
        &mut self,
        mut revision: RecipeTypeRevision,
    ) -> OrchestratorResult<RecipeTypeRevision> {
        let state = &mut self.working;
        if revision.id == 0 {
            revision.id = next_id(&mut state.sequences.revision);
        }
        state.revisions.insert(revision.id, revision.clone());
        Ok(revision)
    }

    async fn get_recipe_type_revision(
        &mut self,
        recipe_type_name: &str,
        revision_num: i32,
    ) -> OrchestratorResult<Option<RecipeTypeRevision>> {
        Ok(self
            .working
            .revisions
            .values()
            .find(|rev| rev.recipe_type_name == recipe_type_name && rev.revision_num == revision_num)
            .cloned())
    }

    async fn get_recipe_type_revision_by_id(
        &mut self,
        id: i64,
    ) -> OrchestratorResult<Option<RecipeTypeRevision>> {
        Ok(self.working.revisions.get(&id).cloned())
    }

    async fn get_recipes(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Recipe>> {
        Ok(rows_by_ids(&self.working.recipes, ids))
    }

    async fn lock_recipes(&mut self, ids: &[i64]) -> OrchestratorResult<Vec<Recipe>> {
        Ok(rows_by_ids(&self.working.recipes, ids))
    }

    async fn lock_latest_recipes(&mut self, root_ids: &[i64]) -> OrchestratorResult<Vec<Recipe>> {
        let state = &self.working;
        let latest_ids: Vec<i64> = root_ids
            .iter()
            .filter_map(|root_id| state.latest_recipes.get(root_id).copied())
            .collect();
        Ok(rows_by_ids(&state.recipes, &latest_ids))
    }

    async fn find_superseding_recipes(
        &mut self,
        root_ids: &[i64],
        event_id: i64,
    ) -> OrchestratorResult<Vec<Recipe>> {
        let roots: BTreeSet<i64> = root_ids.iter().copied().collect();
        Ok(self
            .working
            .recipes
            .values()
            .filter(|recipe| {
                recipe.event_id == event_id
                    && recipe.superseded_recipe_id.is_some()
                    && roots.contains(&recipe.root_superseded_recipe_id)
            })
            .cloned()
            .collect())
    }

    async fn find_new_recipe(
        &mut self,
        recipe_type_rev_id: i64,
        event_id: i64,
        ingest_event_id: Option<i64>,
        batch_id: Option<i64>,
        input: Option<&Data>,
    ) -> OrchestratorResult<Option<Recipe>> {
        Ok(self
            .working
            .recipes
            .values()
            .find(|recipe| {
                recipe.recipe_type_rev_id == recipe_type_rev_id
                    && recipe.event_id == event_id
                    && recipe.ingest_event_id == ingest_event_id
                    && recipe.batch_id == batch_id
                    && recipe.recipe_id.is_none()
                    && recipe.superseded_recipe_id.is_none()
                    && recipe.input.as_ref() == input
            })
            .cloned())
    }

    #[instrument(skip(self, file_ids), fields(file_count = file_ids.len()))]
    async fn find_recipes_for_files(
        &mut self,
        recipe_type_id: i64,
        file_ids: &[i64],
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<Recipe>> {
        let files: BTreeSet<i64> = file_ids.iter().copied().collect();
        Ok(self
            .working
            .recipes
            .values()
            .rev()
            .filter(|recipe| before_id.is_none_or(|before| recipe.id < before))
            .filter(|recipe| {
                recipe.recipe_type_id == recipe_type_id
                    && recipe.is_top_level()
                    && !recipe.is_superseded
                    && recipe.input_file_ids.iter().any(|id| files.contains(id))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_batch_recipes(
        &mut self,
        batch_id: i64,
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<Recipe>> {
        Ok(self
            .working
            .recipes
            .values()
            .rev()
            .filter(|recipe| before_id.is_none_or(|before| recipe.id < before))
            .filter(|recipe| recipe.batch_id == Some(batch_id) && recipe.is_top_level())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_recipes(&mut self, recipes: Vec<Recipe>) -> OrchestratorResult<Vec<Recipe>> {
        let state = &mut self.working;
        let mut created = Vec::with_capacity(recipes.len());
        for mut recipe in recipes {
            recipe.id = next_id(&mut state.sequences.recipe);
            if recipe.root_superseded_recipe_id == 0 {
                recipe.root_superseded_recipe_id = recipe.id;
            }
            state
                .latest_recipes
                .insert(recipe.root_superseded_recipe_id, recipe.id);
            state.recipes.insert(recipe.id, recipe.clone());
            created.push(recipe);
        }
        debug!(count = created.len(), "Created recipes");
        Ok(created)
    }

    async fn update_recipe(&mut self, recipe: &Recipe) -> OrchestratorResult<()> {
        let row = self
            .working
            .recipes
            .get_mut(&recipe.id)
            .ok_or(OrchestratorError::RecipeNotFound { id: recipe.id })?;
        *row = recipe.clone();
        Ok(())
    }

    async fn supersede_recipes(&mut self, ids: &[i64], when: DateTime<Utc>) -> OrchestratorResult<()> {
        for id in ids {
            if let Some(recipe) = self.working.recipes.get_mut(id) {
                recipe.is_superseded = true;
                recipe.superseded = Some(when);
                recipe.updated_at = when;
            }
        }
        Ok(())
    }

    async fn get_recipe_nodes(&mut self, recipe_id: i64) -> OrchestratorResult<Vec<RecipeNode>> {
        Ok(self
            .working
            .recipe_nodes
            .range((recipe_id, String::new())..(recipe_id + 1, String::new()))
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn create_recipe_nodes(&mut self, nodes: Vec<RecipeNode>) -> OrchestratorResult<()> {
        for node in nodes {
            self.working
                .recipe_nodes
                .insert((node.recipe_id, node.node_name.clone()), node);
        }
        Ok(())
    }

    async fn copy_recipe_nodes(&mut self, copies: Vec<RecipeNodeCopy>) -> OrchestratorResult<()> {
        let nodes = &mut self.working.recipe_nodes;
        for copy in copies {
            for name in &copy.node_names {
                let Some(source) = nodes.get(&(copy.superseded_recipe_id, name.clone())) else {
                    continue;
                };
                let key = (copy.recipe_id, name.clone());
                if nodes.contains_key(&key) {
                    continue;
                }
                let node = RecipeNode {
                    recipe_id: copy.recipe_id,
                    is_original: false,
                    ..source.clone()
                };
                nodes.insert(key, node);
            }
        }
        Ok(())
    }

    async fn get_parent_node(&mut self, sub_recipe_id: i64) -> OrchestratorResult<Option<RecipeNode>> {
        let mut candidates = self
            .working
            .recipe_nodes
            .values()
            .filter(|node| node.sub_recipe_id == Some(sub_recipe_id));
        let first = candidates.next().cloned();
        let original = candidates.find(|node| node.is_original).cloned();
        Ok(match first {
            Some(node) if node.is_original => Some(node),
            other => original.or(other),
        })
    }
}
