pub mod api;
pub mod config;
pub mod engine;
pub mod proxy;
pub mod source;

pub use api::preload_api::PreloadEngine;
pub use config::PreloadConfig;
pub use engine::event::{FailureKind, PreloadEvent, PreloadOutcome};
pub use engine::scheduler::{Admission, PreloadScheduler};
pub use engine::task::{target_length, PreloadHandle, PreloadRequest};
pub use proxy::file_proxy::FileCacheProxy;
pub use proxy::traits::CacheProxy;
