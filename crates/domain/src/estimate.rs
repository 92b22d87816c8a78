//! 批次创建前的配方数量估算

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::definition::{NodeType, RecipeDefinition};
use crate::diff::{DiffStatus, RecipeDiff};
use crate::forced_nodes::ForcedNodes;

/// 按 (配方类型名, 修订号) 查找子配方定义
pub trait DefinitionLookup {
    fn definition(&self, recipe_type_name: &str, revision_num: i32) -> Option<&RecipeDefinition>;
}

impl DefinitionLookup for BTreeMap<(String, i32), RecipeDefinition> {
    fn definition(&self, recipe_type_name: &str, revision_num: i32) -> Option<&RecipeDefinition> {
        self.get(&(recipe_type_name.to_string(), revision_num))
    }
}

/// 估算总数 = 顶层配方数 × 每个顶层配方创建的配方数
pub fn estimate_recipes(top_level_recipes: i64, recipes_per_root: i64) -> i64 {
    top_level_recipes.max(0) * recipes_per_root.max(0)
}

/// 新配方：自身加上全部（嵌套）子配方
pub fn recipes_per_new_root(definition: &RecipeDefinition, lookup: &dyn DefinitionLookup) -> i64 {
    count_all(definition, lookup, &mut Vec::new())
}

/// 重新处理：自身加上差异中会被重新创建的子配方
pub fn recipes_per_reprocessed_root(diff: &RecipeDiff, lookup: &dyn DefinitionLookup) -> i64 {
    let mut total = 1;
    if !diff.can_be_reprocessed {
        return total;
    }
    for node_diff in diff.nodes() {
        let NodeType::Recipe {
            recipe_type_name,
            revision_num,
        } = &node_diff.node_type
        else {
            continue;
        };
        if node_diff.status == DiffStatus::Deleted || !node_diff.reprocess_new_node {
            continue;
        }
        let Some(sub_definition) = lookup.definition(recipe_type_name, *revision_num) else {
            total += 1;
            continue;
        };
        let full = node_diff.status == DiffStatus::New || node_diff.should_be_recursively_superseded();
        total += match (&node_diff.force_reprocess_nodes, full) {
            (Some(sub_forced), false) => count_forced(sub_definition, sub_forced, lookup, &mut Vec::new()),
            _ => count_all(sub_definition, lookup, &mut Vec::new()),
        };
    }
    total
}

fn sub_definition<'a>(
    node_type: &NodeType,
    lookup: &'a dyn DefinitionLookup,
    stack: &[String],
) -> Option<(&'a RecipeDefinition, String)> {
    match node_type {
        NodeType::Recipe {
            recipe_type_name,
            revision_num,
        } if !stack.contains(recipe_type_name) => lookup
            .definition(recipe_type_name, *revision_num)
            .map(|definition| (definition, recipe_type_name.clone())),
        _ => None,
    }
}

fn count_all(
    definition: &RecipeDefinition,
    lookup: &dyn DefinitionLookup,
    stack: &mut Vec<String>,
) -> i64 {
    let mut total = 1;
    for node in definition.nodes().filter(|node| node.is_recipe()) {
        total += match sub_definition(&node.node_type, lookup, stack) {
            Some((sub, name)) => {
                stack.push(name);
                let count = count_all(sub, lookup, stack);
                stack.pop();
                count
            }
            None => 1,
        };
    }
    total
}

/// 部分强制：被强制的节点及其全部后代会重新创建
fn count_forced(
    definition: &RecipeDefinition,
    forced: &ForcedNodes,
    lookup: &dyn DefinitionLookup,
    stack: &mut Vec<String>,
) -> i64 {
    if forced.all_nodes {
        return count_all(definition, lookup, stack);
    }

    let mut reprocessed: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = definition
        .nodes()
        .filter(|node| forced.is_node_forced_to_reprocess(&node.name))
        .map(|node| node.name.clone())
        .collect();
    while let Some(name) = queue.pop_front() {
        if !reprocessed.insert(name.clone()) {
            continue;
        }
        if let Some(node) = definition.node(&name) {
            queue.extend(node.children.iter().cloned());
        }
    }

    let mut total = 1;
    for name in &reprocessed {
        let Some(node) = definition.node(name) else {
            continue;
        };
        if !node.is_recipe() {
            continue;
        }
        total += match sub_definition(&node.node_type, lookup, stack) {
            Some((sub, sub_name)) => {
                stack.push(sub_name);
                let count = match forced.get_forced_nodes_for_subrecipe(name) {
                    Some(sub_forced) => count_forced(sub, &sub_forced, lookup, stack),
                    None => count_all(sub, lookup, stack),
                };
                stack.pop();
                count
            }
            None => 1,
        };
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Interface, Parameter};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn input() -> Interface {
        Interface::new().with_parameter(Parameter::file("INPUT", true, false))
    }

    fn lookup() -> BTreeMap<(String, i32), RecipeDefinition> {
        let mut leaf = RecipeDefinition::new(input());
        leaf.add_job_node("x", "job-x", "1", 1).unwrap();

        let mut middle = RecipeDefinition::new(input());
        middle.add_job_node("m1", "job-m", "1", 1).unwrap();
        middle.add_recipe_node("leaf_a", "leaf", 1).unwrap();
        middle.add_recipe_node("leaf_b", "leaf", 1).unwrap();
        middle.add_dependency("m1", "leaf_a", true).unwrap();

        let mut map = BTreeMap::new();
        map.insert(("leaf".to_string(), 1), leaf);
        map.insert(("middle".to_string(), 1), middle);
        map
    }

    fn top() -> RecipeDefinition {
        let mut definition = RecipeDefinition::new(input());
        definition.add_job_node("a", "job-a", "1", 1).unwrap();
        definition.add_job_node("b", "job-b", "1", 1).unwrap();
        definition.add_recipe_node("r1", "middle", 1).unwrap();
        definition.add_recipe_node("r2", "leaf", 1).unwrap();
        definition.add_dependency("a", "b", true).unwrap();
        definition.add_dependency("b", "r1", true).unwrap();
        definition.add_dependency("a", "r2", true).unwrap();
        definition
    }

    fn estimate_with(forced: Option<ForcedNodes>) -> i64 {
        let definition = top();
        let mut diff = RecipeDiff::new(&definition, &definition).unwrap();
        if let Some(forced) = forced {
            diff.set_force_reprocess(forced);
        }
        recipes_per_reprocessed_root(&diff, &lookup())
    }

    #[test]
    fn test_new_recipe_counts_every_nested_recipe() {
        // top + r1(middle + 2 leaves) + r2
        assert_eq!(recipes_per_new_root(&top(), &lookup()), 5);
        assert_eq!(estimate_recipes(10, 5), 50);
        assert_eq!(estimate_recipes(-1, 5), 0);
    }

    #[test]
    fn test_reprocess_counts_only_recreated_sub_recipes() {
        assert_eq!(estimate_with(None), 1);
        assert_eq!(estimate_with(Some(ForcedNodes::all())), 5);

        // b 被强制，r1 作为后代整体重新创建
        let mut forced = ForcedNodes::new();
        forced.add_node("b");
        assert_eq!(estimate_with(Some(forced)), 5 - 1);

        let mut partial = ForcedNodes::new();
        let mut inner = ForcedNodes::new();
        inner.add_node("leaf_b");
        partial.add_subrecipe("r1", inner);
        // top + middle + leaf_b
        assert_eq!(estimate_with(Some(partial)), 3);
    }

    #[test]
    fn test_more_forced_nodes_never_lowers_estimate() {
        let names = ["a", "b", "r1", "r2"];
        let inner_names = ["m1", "leaf_a", "leaf_b"];
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            let mut forced = ForcedNodes::new();
            let mut inner = ForcedNodes::new();
            for name in names {
                if name != "r1" && rng.random_bool(0.3) {
                    forced.add_node(name);
                }
            }
            for name in inner_names {
                if rng.random_bool(0.3) {
                    inner.add_node(name);
                }
            }
            let use_inner = rng.random_bool(0.5);
            if use_inner {
                forced.add_subrecipe("r1", inner.clone());
            }
            let before = estimate_with(Some(forced.clone()));

            let mut more = forced.clone();
            let extra = names[rng.random_range(0..names.len())];
            if extra != "r1" {
                more.add_node(extra);
            } else if use_inner {
                let mut wider = inner.clone();
                wider.add_node(inner_names[rng.random_range(0..inner_names.len())]);
                more.add_subrecipe("r1", wider);
            }
            let after = estimate_with(Some(more.clone()));
            assert!(after >= before, "{after} < {before} for {more:?}");

            let mut all = more;
            all.set_all_nodes();
            assert!(estimate_with(Some(all)) >= after);
        }
    }
}
