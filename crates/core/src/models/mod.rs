//! # 数据模型
//!
//! 跨 crate 共享的基础数据结构：消息信封、资源量、资源供给通道上的事件。

pub mod message;
pub mod offer;
pub mod resources;

pub use message::*;
pub use offer::*;
pub use resources::*;
