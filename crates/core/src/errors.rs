use thiserror::Error;

/// 编排器错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("存储错误: {0}")]
    Store(String),

    #[error("配方定义无效 [{code}]: {message}")]
    InvalidDefinition { code: String, message: String },

    #[error("批次配置无效: {0}")]
    InvalidConfiguration(String),

    #[error("输入数据无效 [{code}]: {message}")]
    InvalidData { code: String, message: String },

    #[error("配方连接无效: {0}")]
    InvalidRecipeConnection(String),

    #[error("配方类型未激活: {0}")]
    InactiveRecipeType(String),

    #[error("作业类型未激活: {0}")]
    InactiveJobType(String),

    #[error("状态冲突: {0}")]
    StatusConflict(String),

    #[error("状态无效: {0}")]
    InvalidStatus(String),

    #[error("资源不足: {0}")]
    InsufficientResources(String),

    #[error("配方未找到: {id}")]
    RecipeNotFound { id: i64 },

    #[error("配方类型未找到: {name}")]
    RecipeTypeNotFound { name: String },

    #[error("配方类型修订未找到: {name} r{revision_num}")]
    RecipeTypeRevisionNotFound { name: String, revision_num: i32 },

    #[error("作业类型未找到: {name} {version}")]
    JobTypeNotFound { name: String, version: String },

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("作业执行未找到: {id}")]
    JobExecutionNotFound { id: i64 },

    #[error("批次未找到: {id}")]
    BatchNotFound { id: i64 },

    #[error("数据集未找到: {id}")]
    DatasetNotFound { id: i64 },

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("资源通道错误: {0}")]
    Transport(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn invalid_definition(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidData {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn status_conflict(message: impl Into<String>) -> Self {
        Self::StatusConflict(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::InsufficientResources(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 调用方重试可能成功的错误（并发冲突、存储/队列/通道故障）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::MessageQueue(_) | Self::Transport(_) | Self::StatusConflict(_)
        )
    }

    /// 定义、数据、配置类错误：同步报告给调用方，永不重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidDefinition { .. }
                | Self::InvalidConfiguration(_)
                | Self::InvalidData { .. }
                | Self::InvalidRecipeConnection(_)
                | Self::InactiveRecipeType(_)
                | Self::InactiveJobType(_)
                | Self::Configuration(_)
        )
    }

    /// 错误码，用于结构化日志
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidDefinition { code, .. } | Self::InvalidData { code, .. } => code,
            Self::Store(_) => "STORE",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::InvalidRecipeConnection(_) => "INVALID_RECIPE_CONNECTION",
            Self::InactiveRecipeType(_) => "INACTIVE_RECIPE_TYPE",
            Self::InactiveJobType(_) => "INACTIVE_JOB_TYPE",
            Self::StatusConflict(_) => "STATUS_CONFLICT",
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            Self::RecipeNotFound { .. }
            | Self::RecipeTypeNotFound { .. }
            | Self::RecipeTypeRevisionNotFound { .. }
            | Self::JobTypeNotFound { .. }
            | Self::JobNotFound { .. }
            | Self::JobExecutionNotFound { .. }
            | Self::BatchNotFound { .. }
            | Self::DatasetNotFound { .. } => "NOT_FOUND",
            Self::MessageQueue(_) => "MESSAGE_QUEUE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Transport(_) => "TRANSPORT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = OrchestratorError::status_conflict("execution 7 changed");
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal());

        let definition = OrchestratorError::invalid_definition("CIRCULAR_DEPENDENCY", "a -> b -> a");
        assert!(definition.is_fatal());
        assert!(!definition.is_retryable());
        assert_eq!(definition.code(), "CIRCULAR_DEPENDENCY");

        let inactive = OrchestratorError::InactiveRecipeType("my-recipe".to_string());
        assert!(inactive.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::RecipeTypeRevisionNotFound {
            name: "ingest".to_string(),
            revision_num: 3,
        };
        assert_eq!(err.to_string(), "配方类型修订未找到: ingest r3");
    }
}
