//! Command-line definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

const AFTER_HELP: &str = "\
Examples:
  tether serve --port 13567           Publish the Greeter service
  tether call --name world            Call Greeter1.0.hello(\"world\")
  tether ping 127.0.0.1:13567         Heartbeat round trip to an endpoint";

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "tether: request/response RPC over framed TCP",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (defaults to ~/.tether/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish the Greeter service and serve until Ctrl+C.
    Serve {
        /// Listen port (overrides provider_port).
        #[arg(long)]
        port: Option<u16>,
        /// Close each connection after its response is written.
        #[arg(long)]
        close_after_response: bool,
    },
    /// Call Greeter1.0.hello.
    Call {
        /// Name to greet.
        #[arg(long, default_value = "world")]
        name: String,
        /// Target endpoint (host:port), bypassing configured discovery entries.
        #[arg(long)]
        endpoint: Option<String>,
        /// Serializer for this call (msgpack, json).
        #[arg(long)]
        serializer: Option<String>,
        /// Compressor for this call (none, gzip, lz4).
        #[arg(long)]
        compressor: Option<String>,
    },
    /// Send a heartbeat ping and report the round-trip time.
    Ping {
        /// Endpoint (host:port).
        endpoint: String,
    },
}
