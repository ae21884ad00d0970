//! In-process backend used for local development and tests.

mod memory_backend;
mod memory_connector;

pub use memory_backend::*;
pub use memory_connector::*;
