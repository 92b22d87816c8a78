pub mod batch;
pub mod error;
pub mod job;
pub mod node;
pub mod recipe;

pub use batch::*;
pub use error::*;
pub use job::*;
pub use node::*;
pub use recipe::*;
