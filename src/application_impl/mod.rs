mod refresh_lock;
mod retry;
mod session_codec;
mod session_store_impl;
mod topology_resolver;

pub use refresh_lock::*;
pub use retry::*;
pub use session_codec::*;
pub use session_store_impl::*;
pub use topology_resolver::*;
