// Caching-proxy collaborator: the interface preloading consumes and a file-layout adapter.

pub mod file_proxy;
pub mod traits;
