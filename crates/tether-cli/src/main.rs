//! tether CLI: serve the Greeter demo service, call it, or ping an endpoint.

mod cli;
mod cmd;
mod greeter;

use clap::Parser;
use cli::{Cli, Commands};

/// Trace to stderr so stdout stays clean for command output.
fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Serve {
            port,
            close_after_response,
        } => cmd::serve::cmd_serve(cli.config, port, close_after_response),
        Commands::Call {
            name,
            endpoint,
            serializer,
            compressor,
        } => cmd::client::cmd_call(cli.config, &name, endpoint, serializer, compressor),
        Commands::Ping { endpoint } => cmd::client::cmd_ping(cli.config, &endpoint),
    }
}
