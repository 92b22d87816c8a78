use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::RecipeDefinition;
use crate::interface::Data;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeType {
    pub id: i64,
    pub name: String,
    pub title: String,
    pub revision_num: i32,
    pub is_active: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 配方类型的一个不可变修订
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeTypeRevision {
    pub id: i64,
    pub recipe_type_id: i64,
    pub recipe_type_name: String,
    pub revision_num: i32,
    pub definition: RecipeDefinition,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeCounts {
    pub jobs_total: i32,
    pub jobs_pending: i32,
    pub jobs_blocked: i32,
    pub jobs_queued: i32,
    pub jobs_running: i32,
    pub jobs_failed: i32,
    pub jobs_completed: i32,
    pub jobs_canceled: i32,
    pub sub_recipes_total: i32,
    pub sub_recipes_completed: i32,
}

impl RecipeCounts {
    /// 阻塞下游的作业数（BLOCKED + CANCELED + FAILED）
    pub fn blocking_jobs(&self) -> i32 {
        self.jobs_blocked + self.jobs_canceled + self.jobs_failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: i64,
    pub recipe_type_id: i64,
    pub recipe_type_name: String,
    pub recipe_type_rev_id: i64,
    pub revision_num: i32,
    pub event_id: i64,
    pub ingest_event_id: Option<i64>,
    /// 顶层配方
    pub root_recipe_id: Option<i64>,
    /// 直接父配方
    pub recipe_id: Option<i64>,
    pub batch_id: Option<i64>,
    /// 取代链的根，链首配方指向自身
    pub root_superseded_recipe_id: i64,
    pub superseded_recipe_id: Option<i64>,
    pub is_superseded: bool,
    pub superseded: Option<DateTime<Utc>>,
    pub input: Option<Data>,
    pub input_file_ids: Vec<i64>,
    pub is_input_processed: bool,
    pub is_completed: bool,
    pub completed: Option<DateTime<Utc>>,
    pub counts: RecipeCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipe {
    /// 新配方（尚未分配 ID）
    pub fn new(revision: &RecipeTypeRevision, event_id: i64, when: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            recipe_type_id: revision.recipe_type_id,
            recipe_type_name: revision.recipe_type_name.clone(),
            recipe_type_rev_id: revision.id,
            revision_num: revision.revision_num,
            event_id,
            ingest_event_id: None,
            root_recipe_id: None,
            recipe_id: None,
            batch_id: None,
            root_superseded_recipe_id: 0,
            superseded_recipe_id: None,
            is_superseded: false,
            superseded: None,
            input: None,
            input_file_ids: Vec::new(),
            is_input_processed: false,
            is_completed: false,
            completed: None,
            counts: RecipeCounts::default(),
            created_at: when,
            updated_at: when,
        }
    }

    pub fn with_input(mut self, input: Data) -> Self {
        self.input_file_ids = input.file_ids();
        self.input = Some(input);
        self
    }

    /// 作为 `superseded` 的后继，继承取代链的根
    pub fn superseding(mut self, superseded: &Recipe) -> Self {
        self.superseded_recipe_id = Some(superseded.id);
        self.root_superseded_recipe_id = superseded.root_superseded_recipe_id;
        self
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn is_top_level(&self) -> bool {
        self.recipe_id.is_none()
    }

    /// 本配方所在配方树的根
    pub fn tree_root_id(&self) -> i64 {
        self.root_recipe_id.unwrap_or(self.id)
    }
}

/// 配方中一个节点对应的作业或子配方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeNode {
    pub recipe_id: i64,
    pub node_name: String,
    pub job_id: Option<i64>,
    pub sub_recipe_id: Option<i64>,
    /// 从被取代配方复制过来的节点为 false
    pub is_original: bool,
}

impl RecipeNode {
    pub fn for_job(recipe_id: i64, node_name: impl Into<String>, job_id: i64) -> Self {
        Self {
            recipe_id,
            node_name: node_name.into(),
            job_id: Some(job_id),
            sub_recipe_id: None,
            is_original: true,
        }
    }

    pub fn for_sub_recipe(recipe_id: i64, node_name: impl Into<String>, sub_recipe_id: i64) -> Self {
        Self {
            recipe_id,
            node_name: node_name.into(),
            job_id: None,
            sub_recipe_id: Some(sub_recipe_id),
            is_original: true,
        }
    }
}

/// 把被取代配方中的节点复制到新配方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeNodeCopy {
    pub superseded_recipe_id: i64,
    pub recipe_id: i64,
    pub node_names: Vec<String>,
}
