use crate::cmd::{fail, runtime};
use crate::greeter;
use std::path::PathBuf;
use std::sync::Arc;
use tether_types::config::load_config;
use tether_wire::{PluginRegistry, StaticDiscovery, TransportServer};
use tracing::info;

pub fn cmd_serve(config: Option<PathBuf>, port: Option<u16>, close_after_response: bool) {
    let mut config = load_config(config.as_deref());
    if let Some(port) = port {
        config.provider_port = port;
    }
    config.close_after_response |= close_after_response;

    let discovery = match StaticDiscovery::from_config(&config) {
        Ok(d) => Arc::new(d),
        Err(e) => fail(&e.to_string()),
    };

    let rt = runtime(&config);
    rt.block_on(async move {
        let server = TransportServer::new(Arc::new(PluginRegistry::with_defaults()), discovery);
        if let Err(e) = server.configure(config) {
            fail(&e.to_string());
        }
        let addr = match server.publish(greeter::service()).await {
            Ok(addr) => addr,
            Err(e) => fail(&format!("Failed to publish Greeter: {e}")),
        };
        println!("Serving {}{} on {addr}", greeter::INTERFACE, greeter::VERSION);

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler failed, shutting down");
        }
        info!(connections = server.connection_count(), "Shutting down");
        server.shutdown();
    });
}
