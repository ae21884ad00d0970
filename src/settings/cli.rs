use super::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "ticketvault", about = "Inspect and manage stored proxy sessions")]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store a session built from a JSON payload
    Save {
        /// Session id; a fresh one is generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Payload as JSON, e.g. '{"user":"alice"}'
        #[arg(long)]
        payload: String,
    },
    /// Print a stored session
    Load {
        #[arg(long)]
        id: String,
    },
    /// Extend a session's expiry
    Refresh {
        #[arg(long)]
        id: String,
    },
    /// Delete a session and its lock
    Clear {
        #[arg(long)]
        id: String,
    },
    /// Check that the backend answers
    Ping,
}
