use crate::cmd::{fail, runtime};
use crate::greeter::{self, GreeterClient};
use std::path::PathBuf;
use std::sync::Arc;
use tether_types::config::load_config;
use tether_types::message::{service_key, Endpoint};
use tether_wire::{CallOptions, Discovery, PluginRegistry, StaticDiscovery, TransportClient};

pub fn cmd_call(
    config: Option<PathBuf>,
    name: &str,
    endpoint: Option<String>,
    serializer: Option<String>,
    compressor: Option<String>,
) {
    let config = load_config(config.as_deref());
    let discovery = match StaticDiscovery::from_config(&config) {
        Ok(d) => Arc::new(d),
        Err(e) => fail(&e.to_string()),
    };
    let target = endpoint.map(|raw| match raw.parse::<Endpoint>() {
        Ok(ep) => ep,
        Err(e) => fail(&format!("Invalid endpoint '{raw}': {e}")),
    });

    let mut options = CallOptions::default();
    if let Some(s) = serializer {
        options = options.serializer(s);
    }
    if let Some(c) = compressor {
        options = options.compressor(c);
    }

    let rt = runtime(&config);
    let name = name.to_string();
    rt.block_on(async move {
        let group = config.discovery_group.clone();
        if let Some(ep) = target {
            let key = service_key(greeter::INTERFACE, greeter::VERSION);
            if let Err(e) = discovery.register(&group, &key, &ep).await {
                fail(&e.to_string());
            }
        }

        let client = TransportClient::new(Arc::new(PluginRegistry::with_defaults()), discovery);
        if let Err(e) = client.configure(config) {
            fail(&e.to_string());
        }
        let stub = GreeterClient::new(client.clone(), group, options);
        let result = stub.hello(&name).await;
        client.shutdown();
        match result {
            Ok(greeting) => println!("{greeting}"),
            Err(e) => fail(&format!("Call failed [{}]: {e}", e.code())),
        }
    });
}

pub fn cmd_ping(config: Option<PathBuf>, endpoint: &str) {
    let config = load_config(config.as_deref());
    let endpoint = match endpoint.parse::<Endpoint>() {
        Ok(ep) => ep,
        Err(e) => fail(&format!("Invalid endpoint '{endpoint}': {e}")),
    };

    let rt = runtime(&config);
    rt.block_on(async move {
        let client = TransportClient::new(
            Arc::new(PluginRegistry::with_defaults()),
            Arc::new(StaticDiscovery::new()),
        );
        if let Err(e) = client.configure(config) {
            fail(&e.to_string());
        }
        let result = client.ping(&endpoint).await;
        client.shutdown();
        match result {
            Ok(rtt) => println!("pong from {endpoint} in {:.1}ms", rtt.as_secs_f64() * 1000.0),
            Err(e) => fail(&format!("Ping failed: {e}")),
        }
    });
}
