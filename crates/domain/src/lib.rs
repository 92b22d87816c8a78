//! 编排领域模型
//!
//! 配方定义与差异、配方实例的状态传播、实体以及存储抽象。
//! 本 crate 不做任何 I/O，存储由 [`store::Store`] 的实现提供。

pub mod definition;
pub mod diff;
pub mod entities;
pub mod estimate;
pub mod forced_nodes;
pub mod instance;
pub mod interface;
pub mod store;

pub use definition::{NodeDefinition, NodeType, RecipeDefinition};
pub use diff::{DiffStatus, RecipeDiff};
pub use entities::*;
pub use forced_nodes::ForcedNodes;
pub use instance::{NodeInstance, NodeKind, RecipeInstance};
pub use interface::{Data, DataValue, Interface, Parameter};
pub use store::{
    BatchRepository, JobRepository, NodeRepository, QueueRepository, RecipeRepository, Store,
    Transaction,
};
