use crate::cli::download;
use clap::Parser;

mod cli;
mod logging;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    download(cli).await;
}
