// Engine orchestration: preload queue, task execution and lifecycle events.

pub mod error;
pub mod event;
pub mod scheduler;
pub mod task;
