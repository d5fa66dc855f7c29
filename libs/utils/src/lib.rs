pub mod backoff;
pub mod id;
pub mod logging;
