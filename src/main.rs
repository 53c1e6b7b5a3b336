//! callhook CLI entry point.

use clap::Parser;

use callhook::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;

    if let Err(err) = cli::run(cli).await {
        cli::handle_error(err, json_mode);
    }
}
