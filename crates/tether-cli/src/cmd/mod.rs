//! Command implementations.

pub mod client;
pub mod serve;

use tether_types::config::RpcConfig;

/// Build the runtime sized from `worker_threads`, or exit.
pub(crate) fn runtime(config: &RpcConfig) -> tokio::runtime::Runtime {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.effective_workers())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(&format!("Failed to start runtime: {e}")),
    }
}

pub(crate) fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}
