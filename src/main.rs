mod cli;
mod commands;
mod output;

use clap::Parser;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = cli::Cli::parse();
    init_tracing(cli.json);
    let output = cli.output();

    match commands::dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            output::emit_error(output, &e);
            ExitCode::from(output::exit_code_for(&e))
        }
    }
}
