mod connector;
mod kv_backend;

pub use connector::*;
pub use kv_backend::*;
