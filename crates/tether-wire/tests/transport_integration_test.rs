//! End-to-end tests: a real server and client talking over loopback TCP.
//!
//! Discovery is the in-memory backend, shared between both sides so that
//! `publish` on the server is visible to `resolve` on the client.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_types::config::{ReconnectConfig, RpcConfig};
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::{Endpoint, Request, STATUS_ERROR, STATUS_OK};
use tether_wire::discovery::Discovery;
use tether_wire::frame::{
    Body, BodyKind, FrameCodec, Message, MessageKind, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN, MAGIC,
    PROTOCOL_VERSION,
};
use tether_wire::plugin::{CompressionKind, JsonSerializer, SerializationKind, Serializer};
use tether_wire::watchdog::LinkState;
use tether_wire::{
    CallOptions, PluginRegistry, ServiceDefinition, StaticDiscovery, TransportClient,
    TransportServer,
};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn greeter() -> ServiceDefinition {
    ServiceDefinition::new("Greeter", "1.0")
        .method("hello", &["String"], |params| async move {
            match params.first().and_then(Value::as_str) {
                Some(name) => Ok(json!(format!("hello {name}"))),
                None => Err("hello expects a string".to_string()),
            }
        })
        .method("echo", &["String"], |params| async move {
            Ok::<Value, String>(params.into_iter().next().unwrap_or(Value::Null))
        })
        .method("slow", &[], |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<Value, String>(Value::Null)
        })
}

fn server_config() -> RpcConfig {
    RpcConfig {
        provider_port: 0,
        ..Default::default()
    }
}

fn client_config() -> RpcConfig {
    RpcConfig {
        connect_timeout_ms: 1_000,
        reconnect: ReconnectConfig {
            base_delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: 12,
        },
        ..Default::default()
    }
}

async fn start_server(discovery: Arc<StaticDiscovery>) -> (TransportServer, SocketAddr) {
    let server = TransportServer::new(Arc::new(PluginRegistry::with_defaults()), discovery);
    server.configure(server_config()).unwrap();
    let addr = server.publish(greeter()).await.unwrap();
    (server, addr)
}

fn start_client(discovery: Arc<StaticDiscovery>) -> TransportClient {
    let client = TransportClient::new(Arc::new(PluginRegistry::with_defaults()), discovery);
    client.configure(client_config()).unwrap();
    client
}

fn hello(name: &str) -> Request {
    Request::new("Greeter", "1.0", "hello").with_param("String", json!(name))
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Call scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_round_trip() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let resp = client.call(hello("world").with_id("r1")).await.unwrap();
    assert_eq!(resp.request_id, "r1");
    assert_eq!(resp.status_code, STATUS_OK);
    assert_eq!(resp.payload, Some(json!("hello world")));
    assert_eq!(client.pending_calls(), 0);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_missing_service_keeps_connection_open() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery.clone()).await;
    let endpoint = Endpoint::from(addr);
    // Point discovery at the server for a key it never published.
    discovery
        .register("tether", "Missing1.0", &endpoint)
        .await
        .unwrap();
    let client = start_client(discovery);

    let resp = client
        .call(Request::new("Missing", "1.0", "anything").with_id("r2"))
        .await
        .unwrap();
    assert_eq!(resp.request_id, "r2");
    assert_eq!(resp.status_code, STATUS_ERROR);
    assert_eq!(resp.status_message, "ServiceNotFound");

    let connections = client.connections().unwrap();
    let before = connections.state(&endpoint).unwrap().channel_id;

    let ok = client.call(hello("again")).await.unwrap();
    assert!(ok.is_success());
    assert_eq!(connections.state(&endpoint).unwrap().channel_id, before);
    assert_eq!(connections.live_channels(), 1);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_handler_error_is_failed_response() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let resp = client
        .call(Request::new("Greeter", "1.0", "hello").with_param("String", json!(5)))
        .await
        .unwrap();
    assert_eq!(resp.status_code, STATUS_ERROR);
    assert_eq!(resp.status_message, "InvocationError");

    let resp = client
        .call(Request::new("Greeter", "1.0", "hello").with_param("i64", json!(5)))
        .await
        .unwrap();
    assert_eq!(resp.status_message, "MethodNotFound");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_every_codec_combination_end_to_end() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let payloads = [String::new(), "x".repeat(64 * 1024)];
    for ser in SerializationKind::ALL {
        for comp in CompressionKind::ALL {
            for payload in &payloads {
                let req = Request::new("Greeter", "1.0", "echo")
                    .with_param("String", json!(payload));
                let options = CallOptions::default()
                    .serializer(ser.name())
                    .compressor(comp.name());
                let resp = client.call_with(req, options).await.unwrap();
                assert!(resp.is_success(), "{}/{}", ser.name(), comp.name());
                assert_eq!(resp.payload, Some(json!(payload)));
            }
        }
    }

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_near_max_frame_payload() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let big = "y".repeat(DEFAULT_MAX_FRAME_SIZE - 4096);
    let req = Request::new("Greeter", "1.0", "echo").with_param("String", json!(big));
    let resp = client
        .call_with(
            req,
            CallOptions::default().serializer("msgpack").compressor("none"),
        )
        .await
        .unwrap();
    assert_eq!(resp.payload, Some(json!(big)));

    // Just over the limit is refused before anything is written.
    let too_big = "z".repeat(DEFAULT_MAX_FRAME_SIZE);
    let req = Request::new("Greeter", "1.0", "echo").with_param("String", json!(too_big));
    let err = client
        .call_with(req, CallOptions::default().compressor("none"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
    assert_eq!(client.pending_calls(), 0);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_concurrent_calls_share_one_channel() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let mut handles = Vec::new();
    for i in 0..100 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let resp = client.call(hello(&format!("n{i}"))).await.unwrap();
            (i, resp)
        }));
    }
    for handle in handles {
        let (i, resp) = handle.await.unwrap();
        assert_eq!(resp.payload, Some(json!(format!("hello n{i}"))));
    }

    let connections = client.connections().unwrap();
    assert_eq!(connections.live_channels(), 1);
    assert_eq!(
        connections.state(&Endpoint::from(addr)).unwrap().state,
        LinkState::Active
    );
    assert_eq!(client.pending_calls(), 0);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_pending_call_fails_when_channel_dies() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller
            .call(Request::new("Greeter", "1.0", "slow"))
            .await
    });
    wait_for("call to be in flight", || {
        client.pending_calls() == 1 && server.connection_count() == 1
    })
    .await;
    // Let the request reach the handler before pulling the plug.
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("pending call was never failed")
        .unwrap();
    assert!(matches!(result, Err(RpcError::ChannelClosed(_))));
    assert_eq!(client.pending_calls(), 0);

    client.shutdown();
}

// ---------------------------------------------------------------------------
// Undecodable bodies
// ---------------------------------------------------------------------------

/// JSON on the wire, registered under an id only one side knows.
struct Custom;

impl Serializer for Custom {
    fn name(&self) -> &str {
        "custom"
    }

    fn serialize(&self, body: &Body) -> RpcResult<Vec<u8>> {
        JsonSerializer.serialize(body)
    }

    fn deserialize(&self, bytes: &[u8], kind: BodyKind) -> RpcResult<Body> {
        JsonSerializer.deserialize(bytes, kind)
    }
}

#[tokio::test]
async fn test_serializer_unknown_to_server_fails_call() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let mut plugins = PluginRegistry::with_defaults();
    plugins.register_serializer(0x09, Arc::new(Custom));
    let client = TransportClient::new(Arc::new(plugins), discovery);
    client.configure(client_config()).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.call_with(hello("custom"), CallOptions::default().serializer("custom")),
    )
    .await
    .expect("call with an unknown serializer never completed");
    assert!(matches!(result, Err(RpcError::ChannelClosed(_))));
    assert_eq!(client.pending_calls(), 0);

    // The link recovers and ordinary calls go through.
    let mut answered = false;
    for _ in 0..50 {
        if let Ok(resp) = client.call(hello("plain")).await {
            assert_eq!(resp.payload, Some(json!("hello plain")));
            answered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(answered);

    client.shutdown();
    server.shutdown();
}

fn raw_frame(kind: MessageKind, serialization: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = MAGIC.to_vec();
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&((HEADER_LEN + body.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&[kind as u8, serialization, CompressionKind::None.id()]);
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

#[tokio::test]
async fn test_malformed_response_body_fails_only_that_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::from(listener.local_addr().unwrap());
    let discovery = Arc::new(StaticDiscovery::new());
    discovery.register("tether", "Greeter1.0", &endpoint).await.unwrap();

    // A peer that answers every request with a body the client cannot read.
    let fake = tokio::spawn(async move {
        let codec = FrameCodec::new(Arc::new(PluginRegistry::with_defaults()), DEFAULT_MAX_FRAME_SIZE);
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let Ok(frame) = codec.read_frame(&mut stream).await else {
                break;
            };
            let msg = codec.decode_frame(&frame).unwrap();
            let Some(Body::Request(req)) = msg.body else {
                continue;
            };
            let body = json!({ "request_id": req.request_id, "status_code": "oops" }).to_string();
            let reply = raw_frame(MessageKind::Response, SerializationKind::Json.id(), body.as_bytes());
            tokio::io::AsyncWriteExt::write_all(&mut stream, &reply)
                .await
                .unwrap();
        }
    });

    let client = start_client(discovery);
    let options = CallOptions::default().serializer("json");
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.call_with(hello("first"), options.clone()),
    )
    .await
    .expect("call with a malformed response never completed");
    assert!(matches!(result, Err(RpcError::Codec(_))));
    assert_eq!(client.pending_calls(), 0);

    // Same channel, still usable.
    let connections = client.connections().unwrap();
    let channel = connections.state(&endpoint).unwrap().channel_id;
    let again = client.call_with(hello("second"), options).await;
    assert!(matches!(again, Err(RpcError::Codec(_))));
    let state = connections.state(&endpoint).unwrap();
    assert_eq!(state.state, LinkState::Active);
    assert_eq!(state.channel_id, channel);

    client.shutdown();
    fake.abort();
}

// ---------------------------------------------------------------------------
// Reconnect and eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dead_endpoint_is_evicted_from_fallback() {
    let discovery = Arc::new(StaticDiscovery::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = Endpoint::from(listener.local_addr().unwrap());
    drop(listener);
    discovery.register("tether", "Greeter1.0", &dead).await.unwrap();
    let client = start_client(discovery.clone());

    let err = client.call(hello("anyone")).await.unwrap_err();
    assert!(matches!(err, RpcError::Network(_)));
    assert!(client.endpoint_cache().contains(&dead));

    let connections = client.connections().unwrap();
    wait_for("eviction", || !client.endpoint_cache().contains(&dead)).await;
    let state = connections.state(&dead).unwrap();
    assert_eq!(state.state, LinkState::Evicted);
    assert_eq!(state.attempts, 12);

    // With discovery down there is nothing left to fall back to.
    discovery.set_available(false);
    let err = client.call(hello("anyone")).await.unwrap_err();
    assert!(matches!(err, RpcError::Network(msg) if msg.contains("discovery")));

    client.shutdown();
}

#[tokio::test]
async fn test_cached_endpoint_survives_discovery_outage() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, _) = start_server(discovery.clone()).await;
    let client = start_client(discovery.clone());

    assert!(client.call(hello("first")).await.unwrap().is_success());
    discovery.set_available(false);
    assert!(client.call(hello("second")).await.unwrap().is_success());

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery.clone()).await;
    let client = TransportClient::new(Arc::new(PluginRegistry::with_defaults()), discovery.clone());
    client
        .configure(RpcConfig {
            reconnect: ReconnectConfig {
                base_delay_ms: 5,
                max_delay_ms: 20,
                max_attempts: 500,
            },
            ..client_config()
        })
        .unwrap();
    let endpoint = Endpoint::from(addr);

    assert!(client.call(hello("before")).await.unwrap().is_success());
    let connections = client.connections().unwrap();
    let first = connections.state(&endpoint).unwrap().channel_id;
    server.shutdown();

    // Bring a fresh server up on the same port once the old listener is gone.
    let mut replacement = None;
    for _ in 0..100 {
        let candidate =
            TransportServer::new(Arc::new(PluginRegistry::with_defaults()), discovery.clone());
        candidate
            .configure(RpcConfig {
                provider_port: addr.port(),
                ..Default::default()
            })
            .unwrap();
        if candidate.publish(greeter()).await.is_ok() {
            replacement = Some(candidate);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let replacement = replacement.expect("port never became free");

    wait_for("reconnect", || {
        connections
            .state(&endpoint)
            .map(|s| s.state == LinkState::Active && s.channel_id != first)
            .unwrap_or(false)
    })
    .await;
    assert!(client.call(hello("after")).await.unwrap().is_success());

    client.shutdown();
    replacement.shutdown();
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ping_gets_exactly_one_pong_among_requests() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery).await;
    let codec = FrameCodec::new(Arc::new(PluginRegistry::with_defaults()), DEFAULT_MAX_FRAME_SIZE);
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let ser = SerializationKind::Msgpack.id();
    let comp = CompressionKind::Gzip.id();
    codec
        .write_message(&mut stream, &Message::request(hello("a").with_id("a"), ser, comp))
        .await
        .unwrap();
    codec
        .write_message(&mut stream, &Message::ping(ser, comp))
        .await
        .unwrap();
    codec
        .write_message(&mut stream, &Message::request(hello("b").with_id("b"), ser, comp))
        .await
        .unwrap();

    let mut pongs = 0;
    let mut responses = Vec::new();
    for _ in 0..3 {
        let frame = codec.read_frame(&mut stream).await.unwrap();
        let msg = codec.decode_frame(&frame).unwrap();
        match (msg.kind, msg.body) {
            (MessageKind::HeartbeatPong, _) => pongs += 1,
            (MessageKind::Response, Some(Body::Response(resp))) => responses.push(resp.request_id),
            (kind, _) => panic!("unexpected {kind:?}"),
        }
    }
    responses.sort();
    assert_eq!(pongs, 1);
    assert_eq!(responses, vec!["a".to_string(), "b".to_string()]);

    // Nothing else arrives.
    let extra = tokio::time::timeout(Duration::from_millis(200), codec.read_frame(&mut stream)).await;
    assert!(extra.is_err());

    server.shutdown();
}

#[tokio::test]
async fn test_client_ping() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery.clone()).await;
    let client = start_client(discovery);

    let rtt = client.ping(&Endpoint::from(addr)).await.unwrap();
    assert!(rtt < Duration::from_secs(1));

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_corrupted_frame_closes_server_connection() {
    let discovery = Arc::new(StaticDiscovery::new());
    let (server, addr) = start_server(discovery).await;
    let codec = FrameCodec::new(Arc::new(PluginRegistry::with_defaults()), DEFAULT_MAX_FRAME_SIZE);
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut frame = codec.encode(&Message::ping(1, 0)).unwrap().to_vec();
    frame[4] = 9; // unsupported version
    tokio::io::AsyncWriteExt::write_all(&mut stream, &frame)
        .await
        .unwrap();
    assert!(matches!(
        codec.read_frame(&mut stream).await,
        Err(RpcError::ChannelClosed(_)) | Err(RpcError::Network(_))
    ));

    server.shutdown();
}
