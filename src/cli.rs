use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pixtools")]
#[command(about = "PixTools image-processing job service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the API server, worker pools and maintenance scheduler
    Serve(ServeArgs),

    /// Run one maintenance pass (prune expired jobs and artifacts), then exit
    Prune,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the API server to (overrides config)
    #[arg(long)]
    pub address: Option<SocketAddr>,

    /// Root directory for the fjall ledger and task queue (overrides config)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}
