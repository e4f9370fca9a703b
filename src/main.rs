//! Operations core daemon entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opscore::app::Application;
use opscore::config::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "opscore", about = "Autonomous operations core daemon")]
struct Cli {
    /// Path to a YAML config file, merged over the built-in defaults.
    #[arg(long, env = "OPSCORE_CONFIG_FILE")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List goals from the store as a table, bypassing the HTTP surface.
    Goals {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path).context("failed to load configuration from file")?,
        None => ConfigLoader::load().context("failed to load configuration")?,
    };

    if let Some(Commands::Goals { status, kind, limit }) = &cli.command {
        return opscore::goals_cli::list_goals(&config, status.as_deref(), kind.as_deref(), *limit).await;
    }

    let _logger_guard = opscore::logging::init(&config.logging).context("failed to initialize logger")?;

    let app = Application::bootstrap(config).await.context("failed to bootstrap application")?;
    app.run(shutdown_signal()).await.context("application run loop failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
