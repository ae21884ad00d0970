use std::time::Duration;
use ticketvault::application_port::*;
use ticketvault::domain_model::*;
use ticketvault::logger::*;
use ticketvault::server::*;
use ticketvault::settings::{Cli, Command, Parser, parse_settings};

async fn run(server: &Server, command: Command) -> anyhow::Result<()> {
    let store = server.session_store();
    match command {
        Command::Save { id, payload } => {
            let id = match id {
                Some(id) => id.parse::<SessionId>()?,
                None => SessionId::generate(),
            };
            let payload: SessionPayload = serde_json::from_str(&payload)?;
            let session = Session::new(id, payload, chrono::Utc::now());
            store.save(&session).await?;
            println!("{}", session.id);
        }
        Command::Load { id } => {
            let session = store.load(&id.parse()?).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Command::Refresh { id } => match store.refresh(&id.parse()?).await? {
            RefreshOutcome::Refreshed { expires_at } => println!("refreshed until {expires_at}"),
            RefreshOutcome::Busy => println!("busy: another refresh holds the lock"),
            RefreshOutcome::Unchanged => println!("unchanged"),
        },
        Command::Clear { id } => {
            store.clear(&id.parse()?).await?;
            println!("cleared");
        }
        Command::Ping => {
            let endpoint = server.store().ping().await?;
            println!("PONG from {endpoint}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    let logger_config = LogConfig {
        filter: project_settings.log.filter.clone(),
    };
    logger.reload_from_config(&logger_config)?;

    let server = Server::try_new(&project_settings).await?;

    let result = tokio::select! {
        result = run(&server, cli.command) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    let shutdown_timeout = Duration::from_secs(5);
    match tokio::time::timeout(shutdown_timeout, server.shutdown()).await {
        Ok(_) => info!("session store shut down"),
        Err(_) => error!("session store shutdown timed out"),
    }

    result
}
