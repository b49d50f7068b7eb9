pub mod logging;
pub mod preload_api;
