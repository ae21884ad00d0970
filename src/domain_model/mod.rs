mod clock;
mod key_space;
mod session;
mod ttl_policy;

pub use clock::*;
pub use key_space::*;
pub use session::*;
pub use ttl_policy::*;
