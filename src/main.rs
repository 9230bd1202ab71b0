mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use pixtools::{api, config::Config, scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixtools=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut config = Config::load().map_err(|e| format!("failed to load config: {e}"))?;
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            if let Some(data_dir) = args.data_dir {
                config.server.data_dir = data_dir;
            }
            api::run(config).await?;
        }
        Commands::Prune => {
            let config = Config::load().map_err(|e| format!("failed to load config: {e}"))?;
            let report = scheduler::prune_once(&config).await?;
            println!(
                "pruned {} jobs, {} idempotency records, {} expired objects",
                report.jobs_pruned, report.idempotency_pruned, report.objects_deleted
            );
        }
    }

    Ok(())
}
