//! Transaction state, per-partition init queues, and the distributed init
//! protocol.

pub mod estimate;
pub mod handle;
pub mod init_callback;
pub mod init_queue;
pub mod messages;
pub mod params;
pub mod pool;
pub mod queue_manager;
