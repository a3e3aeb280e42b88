use clap::Parser;

use mcphub_cli::{execute, init_tracing, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_sink);
    let code = execute(cli).await;
    std::process::exit(code);
}
