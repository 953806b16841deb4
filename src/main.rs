use clap::Parser;
use riptide::bootstrap::logging;
use riptide::console::{self, Cli};

#[tokio::main]
async fn main() {
    logging::setup();
    let cli = Cli::parse();
    let code = console::run(cli).await;
    std::process::exit(code);
}
