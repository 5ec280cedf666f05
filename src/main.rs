mod args;
mod cmd_run;
mod cmd_status;
mod cmd_stop;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vwd::clienv;
use vwd::config::Settings;

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?.with_env();

    match cli.command {
        Commands::Run(args) => {
            let json = args.json;
            cmd_run::cmd_run(settings, args.into(), json).await?
        }
        Commands::Status { port, json } => cmd_status::cmd_status(&settings, port, json).await?,
        Commands::Stop { port } => cmd_stop::cmd_stop(&settings, port).await?,
    }

    Ok(())
}

/// Logs go to stderr; stdout carries predictions.
fn init_logging() {
    let filter = clienv::log_filter()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
