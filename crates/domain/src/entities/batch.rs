use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::forced_nodes::ForcedNodes;
use crate::interface::Interface;

pub const BATCH_DEFINITION_SCHEMA_VERSION: &str = "6";

/// 批次定义：从数据集创建新配方，或重新处理上一批次的配方
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BatchDefinitionJson", into = "BatchDefinitionJson")]
pub struct BatchDefinition {
    pub dataset_id: Option<i64>,
    /// 数据集文件已有配方时取代这些配方
    pub supersedes: bool,
    pub forced_nodes: Option<ForcedNodes>,
    /// 上一批次所在链的根批次
    pub root_batch_id: Option<i64>,
    /// 创建批次时解析出的直接前驱批次
    pub prev_batch_id: Option<i64>,
}

impl BatchDefinition {
    pub fn for_dataset(dataset_id: i64) -> Self {
        Self {
            dataset_id: Some(dataset_id),
            supersedes: true,
            ..Self::default()
        }
    }

    pub fn for_previous_batch(root_batch_id: i64) -> Self {
        Self {
            root_batch_id: Some(root_batch_id),
            supersedes: true,
            ..Self::default()
        }
    }

    pub fn with_forced_nodes(mut self, forced_nodes: ForcedNodes) -> Self {
        self.forced_nodes = Some(forced_nodes);
        self
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.dataset_id.is_none() && self.root_batch_id.is_none() {
            return Err(OrchestratorError::invalid_definition(
                "INVALID_BATCH_DEFINITION",
                "Batch definition must specify a dataset or a previous batch",
            ));
        }
        if self.dataset_id.is_some() && self.root_batch_id.is_some() {
            return Err(OrchestratorError::invalid_definition(
                "INVALID_BATCH_DEFINITION",
                "Batch definition cannot specify both a dataset and a previous batch",
            ));
        }
        Ok(())
    }

    pub fn from_json(value: serde_json::Value) -> OrchestratorResult<Self> {
        serde_json::from_value(value).map_err(|err| {
            OrchestratorError::invalid_definition("INVALID_BATCH_DEFINITION", err.to_string())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreviousBatchJson {
    root_batch_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forced_nodes: Option<ForcedNodes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchDefinitionJson {
    #[serde(default = "batch_definition_version")]
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dataset: Option<i64>,
    #[serde(default = "default_supersedes")]
    supersedes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forced_nodes: Option<ForcedNodes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_batch: Option<PreviousBatchJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_batch_id: Option<i64>,
}

fn batch_definition_version() -> String {
    BATCH_DEFINITION_SCHEMA_VERSION.to_string()
}

fn default_supersedes() -> bool {
    true
}

impl TryFrom<BatchDefinitionJson> for BatchDefinition {
    type Error = String;

    fn try_from(value: BatchDefinitionJson) -> Result<Self, Self::Error> {
        if value.version != BATCH_DEFINITION_SCHEMA_VERSION {
            return Err(format!(
                "{} is an unsupported batch definition version",
                value.version
            ));
        }
        let (root_batch_id, prev_forced) = match value.previous_batch {
            Some(prev) => (Some(prev.root_batch_id), prev.forced_nodes),
            None => (None, None),
        };
        Ok(BatchDefinition {
            dataset_id: value.dataset,
            supersedes: value.supersedes,
            forced_nodes: value.forced_nodes.or(prev_forced),
            root_batch_id,
            prev_batch_id: value.prev_batch_id,
        })
    }
}

impl From<BatchDefinition> for BatchDefinitionJson {
    fn from(value: BatchDefinition) -> Self {
        let previous_batch = value.root_batch_id.map(|root_batch_id| PreviousBatchJson {
            root_batch_id,
            forced_nodes: None,
        });
        BatchDefinitionJson {
            version: batch_definition_version(),
            dataset: value.dataset_id,
            supersedes: value.supersedes,
            forced_nodes: value.forced_nodes,
            previous_batch,
            prev_batch_id: value.prev_batch_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfiguration {
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub recipes_total: i32,
    pub recipes_completed: i32,
    pub jobs_total: i32,
    pub jobs_pending: i32,
    pub jobs_blocked: i32,
    pub jobs_queued: i32,
    pub jobs_running: i32,
    pub jobs_failed: i32,
    pub jobs_completed: i32,
    pub jobs_canceled: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub title: Option<String>,
    pub recipe_type_id: i64,
    pub recipe_type_name: String,
    pub recipe_type_rev_id: i64,
    pub revision_num: i32,
    pub event_id: i64,
    pub definition: BatchDefinition,
    pub configuration: BatchConfiguration,
    pub is_superseded: bool,
    pub superseded_batch_id: Option<i64>,
    /// 批次链的根，链首批次指向自身
    pub root_batch_id: i64,
    pub is_creation_done: bool,
    pub recipes_estimated: i64,
    pub counts: BatchCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 批次中一个作业节点名的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub batch_id: i64,
    pub job_name: String,
    pub jobs_total: i32,
    pub jobs_pending: i32,
    pub jobs_blocked: i32,
    pub jobs_queued: i32,
    pub jobs_running: i32,
    pub jobs_failed: i32,
    pub jobs_completed: i32,
    pub jobs_canceled: i32,
    pub min_job_duration: Option<f64>,
    pub avg_job_duration: Option<f64>,
    pub max_job_duration: Option<f64>,
}

/// 按节点名分组的作业聚合结果，由存储层计算
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub node_name: String,
    pub total: i32,
    pub pending: i32,
    pub blocked: i32,
    pub queued: i32,
    pub running: i32,
    pub failed: i32,
    pub completed: i32,
    pub canceled: i32,
    pub min_duration: Option<f64>,
    pub avg_duration: Option<f64>,
    pub max_duration: Option<f64>,
}

impl BatchMetrics {
    pub fn from_statistics(batch_id: i64, stats: &JobStatistics) -> Self {
        Self {
            batch_id,
            job_name: stats.node_name.clone(),
            jobs_total: stats.total,
            jobs_pending: stats.pending,
            jobs_blocked: stats.blocked,
            jobs_queued: stats.queued,
            jobs_running: stats.running,
            jobs_failed: stats.failed,
            jobs_completed: stats.completed,
            jobs_canceled: stats.canceled,
            min_job_duration: stats.min_duration,
            avg_job_duration: stats.avg_duration,
            max_job_duration: stats.max_duration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    /// 数据集成员提供给配方的参数
    pub parameters: Interface,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub id: i64,
    pub dataset_id: i64,
    pub file_id: i64,
    pub parameter_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_defaults() {
        let definition = BatchDefinition::from_json(json!({"dataset": 7})).unwrap();
        assert_eq!(definition.dataset_id, Some(7));
        assert!(definition.supersedes);
        assert!(definition.validate().is_ok());

        let previous = BatchDefinition::from_json(json!({
            "version": "6",
            "previous_batch": {"root_batch_id": 3, "forced_nodes": {"all": true}}
        }))
        .unwrap();
        assert_eq!(previous.root_batch_id, Some(3));
        assert!(previous.forced_nodes.unwrap().all_nodes);
    }

    #[test]
    fn test_definition_validation() {
        assert!(BatchDefinition::default().validate().is_err());
        let mut both = BatchDefinition::for_dataset(1);
        both.root_batch_id = Some(2);
        assert!(both.validate().is_err());
        assert!(BatchDefinition::from_json(json!({"version": "2", "dataset": 1})).is_err());
    }
}
