pub mod backoff;
pub mod op_queue;
pub mod timestamp;
