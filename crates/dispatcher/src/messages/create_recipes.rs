//! 创建配方
//!
//! 三种创建方式共用一个消息：
//! - `new-recipe`：为一份输入数据创建一个顶层配方
//! - `reprocess`：取代若干取代链上最新的配方，按新修订重新处理
//! - `sub-recipes`：为父配方的子配方节点创建子配方
//!
//! 执行时先在事务内加锁，再查找这条消息已经创建过的配方；找到则只重建后续消息。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    Data, ForcedNodes, Recipe, RecipeDiff, RecipeNode, RecipeNodeCopy, RecipeTypeRevision,
    Transaction,
};
use orchestrator_infrastructure::StructuredLogger;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    CommandContext, CommandMessage, ProcessRecipeInput, SupersedeRecipeNodes, UpdateRecipe,
    UpdateRecipeMetrics,
};

/// 父配方中待创建的一个子配方节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRecipe {
    pub recipe_type_name: String,
    pub recipe_type_rev_num: i32,
    pub node_name: String,
    #[serde(default)]
    pub process_input: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "create_recipes_type")]
pub enum CreateRecipesKind {
    #[serde(rename = "new-recipe")]
    NewRecipe {
        recipe_type_name: String,
        recipe_type_rev_num: i32,
        #[serde(default)]
        ingest_event_id: Option<i64>,
        recipe_input_data: Data,
    },
    #[serde(rename = "reprocess")]
    Reprocess {
        recipe_type_name: String,
        recipe_type_rev_num: i32,
        root_recipe_ids: Vec<i64>,
    },
    #[serde(rename = "sub-recipes")]
    SubRecipes {
        recipe_id: i64,
        root_recipe_id: i64,
        #[serde(default)]
        superseded_recipe_id: Option<i64>,
        sub_recipes: Vec<SubRecipe>,
    },
}

impl CreateRecipesKind {
    fn name(&self) -> &'static str {
        match self {
            CreateRecipesKind::NewRecipe { .. } => "new-recipe",
            CreateRecipesKind::Reprocess { .. } => "reprocess",
            CreateRecipesKind::SubRecipes { .. } => "sub-recipes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRecipes {
    pub event_id: i64,
    #[serde(default)]
    pub batch_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_nodes: Option<ForcedNodes>,
    #[serde(flatten)]
    pub kind: CreateRecipesKind,
}

/// 一对修订之间的差异及使用它的 (被取代配方, 新配方) 对
struct DiffGroup {
    old_rev_id: i64,
    new_rev_id: i64,
    forced_nodes: Option<ForcedNodes>,
    diff: RecipeDiff,
    pairs: Vec<(i64, i64)>,
}

impl DiffGroup {
    fn superseded_ids(&self) -> Vec<i64> {
        self.pairs.iter().map(|(old, _)| *old).collect()
    }

    /// 新配方继续使用的强制集合：递归取代的子配方节点内部全部强制
    fn forced_for_new_recipes(&self) -> Option<ForcedNodes> {
        let mut forced = self.forced_nodes.clone().unwrap_or_default();
        for name in self.diff.get_nodes_to_recursively_supersede() {
            forced.add_subrecipe(name, ForcedNodes::all());
        }
        (!forced.is_empty()).then_some(forced)
    }
}

/// 执行结果：创建数与后续消息
struct Outcome {
    recipe_type_name: String,
    created: usize,
    messages: Vec<CommandMessage>,
}

impl CreateRecipes {
    pub fn new_recipe(
        recipe_type_name: impl Into<String>,
        recipe_type_rev_num: i32,
        recipe_input_data: Data,
        event_id: i64,
        ingest_event_id: Option<i64>,
        batch_id: Option<i64>,
        forced_nodes: Option<ForcedNodes>,
    ) -> Self {
        Self {
            event_id,
            batch_id,
            forced_nodes,
            kind: CreateRecipesKind::NewRecipe {
                recipe_type_name: recipe_type_name.into(),
                recipe_type_rev_num,
                ingest_event_id,
                recipe_input_data,
            },
        }
    }

    /// 每条消息最多 `max_num` 个取代链根
    pub fn reprocess_messages(
        recipe_type_name: &str,
        recipe_type_rev_num: i32,
        root_recipe_ids: &[i64],
        event_id: i64,
        batch_id: Option<i64>,
        forced_nodes: Option<ForcedNodes>,
        max_num: usize,
    ) -> Vec<CommandMessage> {
        super::chunked(root_recipe_ids, max_num, |root_recipe_ids| {
            CommandMessage::CreateRecipes(Self {
                event_id,
                batch_id,
                forced_nodes: forced_nodes.clone(),
                kind: CreateRecipesKind::Reprocess {
                    recipe_type_name: recipe_type_name.to_string(),
                    recipe_type_rev_num,
                    root_recipe_ids,
                },
            })
        })
    }

    pub fn sub_recipes(
        parent: &Recipe,
        sub_recipes: Vec<SubRecipe>,
        forced_nodes: Option<ForcedNodes>,
    ) -> Self {
        Self {
            event_id: parent.event_id,
            batch_id: parent.batch_id,
            forced_nodes,
            kind: CreateRecipesKind::SubRecipes {
                recipe_id: parent.id,
                root_recipe_id: parent.tree_root_id(),
                superseded_recipe_id: parent.superseded_recipe_id,
                sub_recipes,
            },
        }
    }

    pub async fn execute(&self, ctx: &CommandContext) -> OrchestratorResult<Vec<CommandMessage>> {
        let when = Utc::now();
        let max_num = ctx.max_num();
        let mut tx = ctx.store.begin().await?;

        let result = match &self.kind {
            CreateRecipesKind::NewRecipe {
                recipe_type_name,
                recipe_type_rev_num,
                ingest_event_id,
                recipe_input_data,
            } => {
                self.create_new_recipe(
                    tx.as_mut(),
                    recipe_type_name,
                    *recipe_type_rev_num,
                    *ingest_event_id,
                    recipe_input_data,
                    when,
                )
                .await
            }
            CreateRecipesKind::Reprocess {
                recipe_type_name,
                recipe_type_rev_num,
                root_recipe_ids,
            } => {
                self.reprocess_recipes(
                    tx.as_mut(),
                    recipe_type_name,
                    *recipe_type_rev_num,
                    root_recipe_ids,
                    when,
                    max_num,
                )
                .await
            }
            CreateRecipesKind::SubRecipes {
                recipe_id,
                root_recipe_id,
                superseded_recipe_id,
                sub_recipes,
            } => {
                self.create_sub_recipes(
                    tx.as_mut(),
                    *recipe_id,
                    *root_recipe_id,
                    *superseded_recipe_id,
                    sub_recipes,
                    when,
                    max_num,
                )
                .await
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(OrchestratorError::InactiveRecipeType(name)) => {
                warn!(recipe_type = %name, create_type = self.kind.name(), "配方类型未激活，不创建配方");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        tx.commit().await?;

        if outcome.created > 0 {
            StructuredLogger::log_recipes_created(
                self.kind.name(),
                &outcome.recipe_type_name,
                outcome.created,
                self.event_id,
                self.batch_id,
            );
            ctx.metrics.record_recipes_created(outcome.created);
        } else {
            debug!(create_type = self.kind.name(), event_id = self.event_id, "配方已存在，只重建后续消息");
        }
        Ok(outcome.messages)
    }

    async fn create_new_recipe(
        &self,
        tx: &mut dyn Transaction,
        recipe_type_name: &str,
        recipe_type_rev_num: i32,
        ingest_event_id: Option<i64>,
        input: &Data,
        when: DateTime<Utc>,
    ) -> OrchestratorResult<Outcome> {
        let revision = active_revision(tx, recipe_type_name, recipe_type_rev_num).await?;

        let existing = tx
            .find_new_recipe(
                revision.id,
                self.event_id,
                ingest_event_id,
                self.batch_id,
                Some(input),
            )
            .await?;
        let (recipe, created) = match existing {
            Some(recipe) => (recipe, 0),
            None => {
                input.validate(&revision.definition.input_interface)?;
                let mut recipe = Recipe::new(&revision, self.event_id, when).with_input(input.clone());
                recipe.ingest_event_id = ingest_event_id;
                recipe.batch_id = self.batch_id;
                let recipe = tx
                    .create_recipes(vec![recipe])
                    .await?
                    .pop()
                    .ok_or_else(|| OrchestratorError::internal("配方创建后没有返回"))?;
                (recipe, 1)
            }
        };

        Ok(Outcome {
            recipe_type_name: recipe_type_name.to_string(),
            created,
            messages: vec![CommandMessage::ProcessRecipeInput(ProcessRecipeInput {
                recipe_ids: vec![recipe.id],
                forced_nodes: self.forced_nodes.clone(),
            })],
        })
    }

    async fn reprocess_recipes(
        &self,
        tx: &mut dyn Transaction,
        recipe_type_name: &str,
        recipe_type_rev_num: i32,
        root_recipe_ids: &[i64],
        when: DateTime<Utc>,
        max_num: usize,
    ) -> OrchestratorResult<Outcome> {
        let latest = tx.lock_latest_recipes(root_recipe_ids).await?;
        let mut revisions: BTreeMap<i64, RecipeTypeRevision> = BTreeMap::new();

        let existing = tx
            .find_superseding_recipes(root_recipe_ids, self.event_id)
            .await?;
        let (pairs, created) = if !existing.is_empty() {
            let superseded_ids: Vec<i64> = existing
                .iter()
                .filter_map(|recipe| recipe.superseded_recipe_id)
                .collect();
            let superseded: BTreeMap<i64, Recipe> = tx
                .get_recipes(&superseded_ids)
                .await?
                .into_iter()
                .map(|recipe| (recipe.id, recipe))
                .collect();
            let pairs: Vec<(Recipe, Recipe)> = existing
                .into_iter()
                .filter_map(|new| {
                    let old = superseded.get(&new.superseded_recipe_id?)?.clone();
                    Some((old, new))
                })
                .collect();
            (pairs, 0)
        } else {
            let revision = active_revision(tx, recipe_type_name, recipe_type_rev_num).await?;
            revisions.insert(revision.id, revision.clone());

            let mut to_reprocess = Vec::new();
            for old in latest {
                if !old.is_top_level() {
                    warn!(recipe.id = old.id, "子配方不能单独重新处理");
                    continue;
                }
                let old_revision = revision_by_id(tx, &mut revisions, old.recipe_type_rev_id).await?;
                let diff = self.diff(&old_revision, &revision, self.forced_nodes.clone())?;
                if !diff.can_be_reprocessed {
                    warn!(recipe.id = old.id, reasons = ?diff.reasons, "配方不能重新处理");
                    continue;
                }
                let mut new = Recipe::new(&revision, self.event_id, when).superseding(&old);
                if let Some(input) = old.input.clone() {
                    new = new.with_input(input);
                }
                new.ingest_event_id = old.ingest_event_id;
                new.batch_id = self.batch_id;
                to_reprocess.push((old, new));
            }

            let superseded_ids: Vec<i64> = to_reprocess.iter().map(|(old, _)| old.id).collect();
            tx.supersede_recipes(&superseded_ids, when).await?;
            let (olds, news): (Vec<Recipe>, Vec<Recipe>) = to_reprocess.into_iter().unzip();
            let created = tx.create_recipes(news).await?;
            let count = created.len();
            (olds.into_iter().zip(created).collect(), count)
        };

        let mut groups = Vec::new();
        for (old, new) in &pairs {
            self.add_to_groups(tx, &mut revisions, &mut groups, old, new, self.forced_nodes.clone())
                .await?;
        }
        if created > 0 {
            copy_nodes(tx, &groups).await?;
        }

        let mut messages = supersede_messages(&groups, when, max_num);
        for group in &groups {
            let new_ids: Vec<i64> = group.pairs.iter().map(|(_, new)| *new).collect();
            messages.extend(super::chunked(&new_ids, max_num, |recipe_ids| {
                CommandMessage::ProcessRecipeInput(ProcessRecipeInput {
                    recipe_ids,
                    forced_nodes: group.forced_for_new_recipes(),
                })
            }));
        }

        Ok(Outcome {
            recipe_type_name: recipe_type_name.to_string(),
            created,
            messages,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_sub_recipes(
        &self,
        tx: &mut dyn Transaction,
        recipe_id: i64,
        root_recipe_id: i64,
        superseded_recipe_id: Option<i64>,
        sub_recipes: &[SubRecipe],
        when: DateTime<Utc>,
        max_num: usize,
    ) -> OrchestratorResult<Outcome> {
        let parent = tx
            .lock_recipes(&[recipe_id])
            .await?
            .pop()
            .ok_or(OrchestratorError::RecipeNotFound { id: recipe_id })?;

        let existing_ids: BTreeMap<String, i64> = tx
            .get_recipe_nodes(parent.id)
            .await?
            .into_iter()
            .filter_map(|node| node.sub_recipe_id.map(|id| (node.node_name, id)))
            .collect();
        let superseded_ids: BTreeMap<String, i64> = match superseded_recipe_id {
            Some(superseded_id) => tx
                .get_recipe_nodes(superseded_id)
                .await?
                .into_iter()
                .filter_map(|node| node.sub_recipe_id.map(|id| (node.node_name, id)))
                .collect(),
            None => BTreeMap::new(),
        };
        let lookup_ids: Vec<i64> = existing_ids
            .values()
            .chain(superseded_ids.values())
            .copied()
            .collect();
        let rows: BTreeMap<i64, Recipe> = tx
            .get_recipes(&lookup_ids)
            .await?
            .into_iter()
            .map(|recipe| (recipe.id, recipe))
            .collect();

        let mut recipes: BTreeMap<String, Recipe> = BTreeMap::new();
        let mut new_recipes = Vec::new();
        let mut revisions: BTreeMap<i64, RecipeTypeRevision> = BTreeMap::new();
        for sub in sub_recipes {
            if let Some(existing) = existing_ids.get(&sub.node_name).and_then(|id| rows.get(id)) {
                recipes.insert(sub.node_name.clone(), existing.clone());
                continue;
            }
            let revision =
                active_revision(tx, &sub.recipe_type_name, sub.recipe_type_rev_num).await?;
            let mut recipe = Recipe::new(&revision, self.event_id, when);
            recipe.recipe_id = Some(parent.id);
            recipe.root_recipe_id = Some(root_recipe_id);
            recipe.batch_id = self.batch_id;
            if let Some(old) = superseded_ids.get(&sub.node_name).and_then(|id| rows.get(id)) {
                recipe = recipe.superseding(old);
            }
            revisions.insert(revision.id, revision);
            new_recipes.push((sub.node_name.clone(), recipe));
        }

        let (names, news): (Vec<String>, Vec<Recipe>) = new_recipes.into_iter().unzip();
        let created = tx.create_recipes(news).await?;
        let created_count = created.len();
        let nodes: Vec<RecipeNode> = names
            .iter()
            .zip(&created)
            .map(|(name, recipe)| RecipeNode::for_sub_recipe(parent.id, name.clone(), recipe.id))
            .collect();
        tx.create_recipe_nodes(nodes).await?;
        recipes.extend(names.into_iter().zip(created));

        let mut groups: Vec<DiffGroup> = Vec::new();
        let mut group_of: BTreeMap<i64, usize> = BTreeMap::new();
        for sub in sub_recipes {
            let Some(new) = recipes.get(&sub.node_name) else {
                continue;
            };
            let Some(old) = new.superseded_recipe_id.and_then(|id| rows.get(&id)) else {
                continue;
            };
            let forced = self.forced_for_sub_recipe(&sub.node_name);
            let index = self
                .add_to_groups(tx, &mut revisions, &mut groups, old, new, forced)
                .await?;
            group_of.insert(new.id, index);
        }
        if created_count > 0 {
            copy_nodes(tx, &groups).await?;
        }

        let mut messages = supersede_messages(&groups, when, max_num);
        for sub in sub_recipes {
            let Some(recipe) = recipes.get(&sub.node_name) else {
                continue;
            };
            let forced = match group_of.get(&recipe.id).and_then(|index| groups.get(*index)) {
                Some(group) => group.forced_for_new_recipes(),
                None => self.forced_for_sub_recipe(&sub.node_name),
            };
            if sub.process_input || recipe.has_input() {
                messages.push(CommandMessage::ProcessRecipeInput(ProcessRecipeInput {
                    recipe_ids: vec![recipe.id],
                    forced_nodes: forced,
                }));
            } else {
                messages.push(CommandMessage::UpdateRecipe(UpdateRecipe::new(
                    recipe.root_superseded_recipe_id,
                    forced,
                )));
            }
        }
        messages.push(CommandMessage::UpdateRecipeMetrics(UpdateRecipeMetrics {
            recipe_ids: vec![parent.id],
        }));

        let recipe_type_name = sub_recipes
            .iter()
            .map(|sub| sub.recipe_type_name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Ok(Outcome {
            recipe_type_name,
            created: created_count,
            messages,
        })
    }

    fn forced_for_sub_recipe(&self, node_name: &str) -> Option<ForcedNodes> {
        self.forced_nodes
            .as_ref()
            .and_then(|forced| forced.get_forced_nodes_for_subrecipe(node_name))
    }

    fn diff(
        &self,
        old: &RecipeTypeRevision,
        new: &RecipeTypeRevision,
        forced_nodes: Option<ForcedNodes>,
    ) -> OrchestratorResult<RecipeDiff> {
        let mut diff = RecipeDiff::new(&old.definition, &new.definition)?;
        if let Some(forced) = forced_nodes {
            diff.set_force_reprocess(forced);
        }
        Ok(diff)
    }

    /// 把一对配方加入相同修订对与强制集合的差异分组，返回分组下标
    async fn add_to_groups(
        &self,
        tx: &mut dyn Transaction,
        revisions: &mut BTreeMap<i64, RecipeTypeRevision>,
        groups: &mut Vec<DiffGroup>,
        old: &Recipe,
        new: &Recipe,
        forced_nodes: Option<ForcedNodes>,
    ) -> OrchestratorResult<usize> {
        if let Some(index) = groups.iter().position(|group| {
            group.old_rev_id == old.recipe_type_rev_id
                && group.new_rev_id == new.recipe_type_rev_id
                && group.forced_nodes == forced_nodes
        }) {
            groups[index].pairs.push((old.id, new.id));
            return Ok(index);
        }
        let old_revision = revision_by_id(tx, revisions, old.recipe_type_rev_id).await?;
        let new_revision = revision_by_id(tx, revisions, new.recipe_type_rev_id).await?;
        let diff = self.diff(&old_revision, &new_revision, forced_nodes.clone())?;
        groups.push(DiffGroup {
            old_rev_id: old.recipe_type_rev_id,
            new_rev_id: new.recipe_type_rev_id,
            forced_nodes,
            diff,
            pairs: vec![(old.id, new.id)],
        });
        Ok(groups.len() - 1)
    }
}

/// 类型必须存在且已激活
async fn active_revision(
    tx: &mut dyn Transaction,
    recipe_type_name: &str,
    revision_num: i32,
) -> OrchestratorResult<RecipeTypeRevision> {
    let recipe_type = tx.get_recipe_type(recipe_type_name).await?.ok_or_else(|| {
        OrchestratorError::RecipeTypeNotFound {
            name: recipe_type_name.to_string(),
        }
    })?;
    if !recipe_type.is_active {
        return Err(OrchestratorError::InactiveRecipeType(recipe_type_name.to_string()));
    }
    tx.get_recipe_type_revision(recipe_type_name, revision_num)
        .await?
        .ok_or_else(|| OrchestratorError::RecipeTypeRevisionNotFound {
            name: recipe_type_name.to_string(),
            revision_num,
        })
}

async fn revision_by_id(
    tx: &mut dyn Transaction,
    cache: &mut BTreeMap<i64, RecipeTypeRevision>,
    revision_id: i64,
) -> OrchestratorResult<RecipeTypeRevision> {
    if let Some(revision) = cache.get(&revision_id) {
        return Ok(revision.clone());
    }
    let revision = tx
        .get_recipe_type_revision_by_id(revision_id)
        .await?
        .ok_or_else(|| OrchestratorError::internal(format!("配方修订 {revision_id} 不存在")))?;
    cache.insert(revision_id, revision.clone());
    Ok(revision)
}

async fn copy_nodes(tx: &mut dyn Transaction, groups: &[DiffGroup]) -> OrchestratorResult<()> {
    let copies: Vec<RecipeNodeCopy> = groups
        .iter()
        .flat_map(|group| {
            let node_names: Vec<String> = group.diff.get_nodes_to_copy().into_iter().collect();
            group
                .pairs
                .iter()
                .map(move |(old, new)| RecipeNodeCopy {
                    superseded_recipe_id: *old,
                    recipe_id: *new,
                    node_names: node_names.clone(),
                })
        })
        .filter(|copy| !copy.node_names.is_empty())
        .collect();
    tx.copy_recipe_nodes(copies).await
}

fn supersede_messages(
    groups: &[DiffGroup],
    when: DateTime<Utc>,
    max_num: usize,
) -> Vec<CommandMessage> {
    groups
        .iter()
        .flat_map(|group| {
            SupersedeRecipeNodes::messages_from_diff(&group.superseded_ids(), &group.diff, when, max_num)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_flattened_with_type_tag() {
        let message = CommandMessage::CreateRecipes(CreateRecipes::new_recipe(
            "ingest",
            2,
            Data::new().with_files("input_a", vec![11]),
            9,
            Some(4),
            None,
            None,
        ));
        let json = message.to_json().unwrap();
        assert_eq!(json["type"], "create_recipes");
        assert_eq!(json["create_recipes_type"], "new-recipe");
        assert_eq!(json["recipe_type_name"], "ingest");
        assert_eq!(json["event_id"], 9);
        assert!(json.get("forced_nodes").is_none());

        let decoded = CommandMessage::from_json(json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_reprocess_messages_split_roots() {
        let roots: Vec<i64> = (1..=5).collect();
        let messages =
            CreateRecipes::reprocess_messages("r", 3, &roots, 1, Some(2), Some(ForcedNodes::all()), 2);
        assert_eq!(messages.len(), 3);
        match &messages[2] {
            CommandMessage::CreateRecipes(CreateRecipes {
                batch_id,
                forced_nodes,
                kind: CreateRecipesKind::Reprocess { root_recipe_ids, .. },
                ..
            }) => {
                assert_eq!(root_recipe_ids, &vec![5]);
                assert_eq!(*batch_id, Some(2));
                assert_eq!(forced_nodes, &Some(ForcedNodes::all()));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_sub_recipes_decode_defaults() {
        let json = serde_json::json!({
            "type": "create_recipes",
            "create_recipes_type": "sub-recipes",
            "event_id": 1,
            "recipe_id": 10,
            "root_recipe_id": 10,
            "sub_recipes": [
                {"recipe_type_name": "inner", "recipe_type_rev_num": 1, "node_name": "node_e"}
            ]
        });
        let decoded = CommandMessage::from_json(json).unwrap();
        let CommandMessage::CreateRecipes(message) = decoded else {
            panic!("expected create_recipes");
        };
        assert_eq!(message.batch_id, None);
        match message.kind {
            CreateRecipesKind::SubRecipes {
                superseded_recipe_id,
                sub_recipes,
                ..
            } => {
                assert_eq!(superseded_recipe_id, None);
                assert!(!sub_recipes[0].process_input);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
