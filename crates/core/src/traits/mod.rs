pub mod message_queue;
pub mod transport;

pub use message_queue::*;
pub use transport::*;
