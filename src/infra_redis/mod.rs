mod redis_backend;
mod redis_connection;
mod redis_connector;

pub use redis_backend::*;
pub use redis_connection::*;
pub use redis_connector::*;
