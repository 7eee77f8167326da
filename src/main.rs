use clap::Parser;
use facegate::cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facegate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { host, port }) => {
            facegate::cli::serve::run(&cli.config, host, port).await?;
        }
        Some(Commands::Migrate) => {
            facegate::cli::migrate::run(&cli.config).await?;
        }
        Some(Commands::Webhook { command }) => {
            facegate::cli::webhook::run(&cli.config, command).await?;
        }
        Some(Commands::Jobs { command }) => {
            facegate::cli::jobs::run(&cli.config, command).await?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
        }
    }

    Ok(())
}
