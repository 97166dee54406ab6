//! CLI entry point for agentrelay.

mod app;
mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    agentrelay::logging::init(args.verbose);
    let code = app::entry::run(args).await;
    std::process::exit(code);
}
