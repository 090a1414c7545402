mod cli;

use anyhow::Result;
use clap::Parser;

use cli::opts::Launchpad;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Launchpad::parse();

    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();

    cli::run(opts).await
}
