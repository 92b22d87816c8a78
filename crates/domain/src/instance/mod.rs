//! 配方实例：把已创建的作业/子配方挂到定义图上，计算状态传播

pub mod node;
pub mod recipe;

pub use node::{NodeInstance, NodeKind};
pub use recipe::{JobsToUpdate, RecipeInstance, RecipeNodeDetails};
