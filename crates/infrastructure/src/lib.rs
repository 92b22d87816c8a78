pub mod database;
pub mod in_memory_queue;
pub mod observability;
pub mod simulated_cluster;

pub use database::*;
pub use in_memory_queue::InMemoryMessageQueue;
pub use observability::*;
pub use simulated_cluster::SimulatedCluster;
