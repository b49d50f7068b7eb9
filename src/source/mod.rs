// Origin access: probing remote media for length and range support.

pub mod http_source;
