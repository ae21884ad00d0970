//! Settings come from a TOML file (`settings/dev.toml` in debug builds,
//! `settings/release.toml` otherwise) overlaid with `TICKETVAULT__*`
//! environment variables.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
