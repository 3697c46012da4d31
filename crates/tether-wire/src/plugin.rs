//! Pluggable compressors and serializers, looked up by their one-byte wire id.
//!
//! The id → name tables are seeded from [`CompressionKind`] and
//! [`SerializationKind`]; implementations are registered by name. A frame
//! header only carries ids, so both lookups must succeed before a body can be
//! encoded or decoded.

use crate::frame::{Body, BodyKind};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tether_types::error::{RpcError, RpcResult};

/// Largest body a decompressor will produce.
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Byte-level transform applied to serialized bodies.
pub trait Compressor: Send + Sync {
    /// Registry name, e.g. `"gzip"`.
    fn name(&self) -> &str;
    fn compress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>>;
    fn decompress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>>;
}

/// Turns request/response bodies into bytes and back.
pub trait Serializer: Send + Sync {
    /// Registry name, e.g. `"msgpack"`.
    fn name(&self) -> &str;
    fn serialize(&self, body: &Body) -> RpcResult<Vec<u8>>;
    /// `kind` comes from the frame header's message type.
    fn deserialize(&self, bytes: &[u8], kind: BodyKind) -> RpcResult<Body>;

    /// Pull just the `request_id` out of a body that failed to deserialize,
    /// so the failure can still be correlated.
    fn request_id(&self, _bytes: &[u8]) -> Option<String> {
        None
    }
}

/// The one field every request and response body shares.
#[derive(Deserialize)]
struct CorrelationOnly {
    request_id: String,
}

/// Built-in compression ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionKind {
    None = 0x00,
    Gzip = 0x01,
    Lz4 = 0x02,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 3] = [Self::None, Self::Gzip, Self::Lz4];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
        }
    }
}

/// Built-in serialization ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializationKind {
    Msgpack = 0x01,
    Json = 0x02,
}

impl SerializationKind {
    pub const ALL: [SerializationKind; 2] = [Self::Msgpack, Self::Json];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Msgpack => "msgpack",
            Self::Json => "json",
        }
    }
}

// ---------------------------------------------------------------------------
// Compressors
// ---------------------------------------------------------------------------

/// Pass-through codec for id 0x00.
#[derive(Debug, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn name(&self) -> &str {
        CompressionKind::None.name()
    }

    fn compress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        if bytes.len() > MAX_DECOMPRESSED_SIZE {
            return Err(too_large(bytes.len()));
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn name(&self) -> &str {
        CompressionKind::Gzip.name()
    }

    fn compress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| RpcError::Codec(format!("gzip compress: {e}")))?;
        encoder
            .finish()
            .map_err(|e| RpcError::Codec(format!("gzip compress: {e}")))
    }

    fn decompress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        let mut out = Vec::new();
        // One byte past the cap tells "exactly at the limit" from "over it".
        GzDecoder::new(bytes)
            .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| RpcError::Codec(format!("gzip decompress: {e}")))?;
        if out.len() > MAX_DECOMPRESSED_SIZE {
            return Err(too_large(out.len()));
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &str {
        CompressionKind::Lz4.name()
    }

    fn compress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(bytes))
    }

    fn decompress(&self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        // Check the little-endian size prefix before allocating.
        if bytes.len() < 4 {
            return Err(RpcError::Codec("lz4 data too short for size prefix".into()));
        }
        let claimed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if claimed > MAX_DECOMPRESSED_SIZE {
            return Err(too_large(claimed));
        }
        lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| RpcError::Codec(format!("lz4 decompress: {e}")))
    }
}

fn too_large(size: usize) -> RpcError {
    RpcError::Codec(format!(
        "decompressed body of {size} bytes exceeds limit of {MAX_DECOMPRESSED_SIZE}"
    ))
}

// ---------------------------------------------------------------------------
// Serializers
// ---------------------------------------------------------------------------

/// MessagePack with named fields.
#[derive(Debug, Default)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn name(&self) -> &str {
        SerializationKind::Msgpack.name()
    }

    fn serialize(&self, body: &Body) -> RpcResult<Vec<u8>> {
        let out = match body {
            Body::Request(req) => rmp_serde::to_vec_named(req),
            Body::Response(resp) => rmp_serde::to_vec_named(resp),
        };
        out.map_err(|e| RpcError::Codec(format!("msgpack encode: {e}")))
    }

    fn deserialize(&self, bytes: &[u8], kind: BodyKind) -> RpcResult<Body> {
        let body = match kind {
            BodyKind::Request => rmp_serde::from_slice(bytes).map(Body::Request),
            BodyKind::Response => rmp_serde::from_slice(bytes).map(Body::Response),
        };
        body.map_err(|e| RpcError::Codec(format!("msgpack decode: {e}")))
    }

    fn request_id(&self, bytes: &[u8]) -> Option<String> {
        rmp_serde::from_slice::<CorrelationOnly>(bytes)
            .ok()
            .map(|c| c.request_id)
    }
}

#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        SerializationKind::Json.name()
    }

    fn serialize(&self, body: &Body) -> RpcResult<Vec<u8>> {
        let out = match body {
            Body::Request(req) => serde_json::to_vec(req),
            Body::Response(resp) => serde_json::to_vec(resp),
        };
        out.map_err(|e| RpcError::Codec(format!("json encode: {e}")))
    }

    fn deserialize(&self, bytes: &[u8], kind: BodyKind) -> RpcResult<Body> {
        let body = match kind {
            BodyKind::Request => serde_json::from_slice(bytes).map(Body::Request),
            BodyKind::Response => serde_json::from_slice(bytes).map(Body::Response),
        };
        body.map_err(|e| RpcError::Codec(format!("json decode: {e}")))
    }

    fn request_id(&self, bytes: &[u8]) -> Option<String> {
        serde_json::from_slice::<CorrelationOnly>(bytes)
            .ok()
            .map(|c| c.request_id)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Id → name → implementation lookup for both codec families.
///
/// Built once at startup and shared read-only behind an `Arc`.
pub struct PluginRegistry {
    compressor_names: HashMap<u8, String>,
    compressors: HashMap<String, Arc<dyn Compressor>>,
    serializer_names: HashMap<u8, String>,
    serializers: HashMap<String, Arc<dyn Serializer>>,
}

impl PluginRegistry {
    /// Id tables seeded from the built-in enums, with no implementations.
    pub fn new() -> Self {
        Self {
            compressor_names: CompressionKind::ALL
                .iter()
                .map(|k| (k.id(), k.name().to_string()))
                .collect(),
            compressors: HashMap::new(),
            serializer_names: SerializationKind::ALL
                .iter()
                .map(|k| (k.id(), k.name().to_string()))
                .collect(),
            serializers: HashMap::new(),
        }
    }

    /// Registry holding every built-in compressor and serializer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_compressor(CompressionKind::None.id(), Arc::new(IdentityCompressor));
        registry.register_compressor(CompressionKind::Gzip.id(), Arc::new(GzipCompressor));
        registry.register_compressor(CompressionKind::Lz4.id(), Arc::new(Lz4Compressor));
        registry.register_serializer(SerializationKind::Msgpack.id(), Arc::new(MsgpackSerializer));
        registry.register_serializer(SerializationKind::Json.id(), Arc::new(JsonSerializer));
        registry
    }

    /// Register a compressor under `id` and its own name. Replaces any
    /// previous entry for either key.
    pub fn register_compressor(&mut self, id: u8, compressor: Arc<dyn Compressor>) {
        let name = compressor.name().to_string();
        self.compressor_names.insert(id, name.clone());
        self.compressors.insert(name, compressor);
    }

    pub fn register_serializer(&mut self, id: u8, serializer: Arc<dyn Serializer>) {
        let name = serializer.name().to_string();
        self.serializer_names.insert(id, name.clone());
        self.serializers.insert(name, serializer);
    }

    /// Resolve a compressor from the id carried in a frame header.
    pub fn load_compress(&self, id: u8) -> RpcResult<Arc<dyn Compressor>> {
        let name = self
            .compressor_names
            .get(&id)
            .ok_or_else(|| not_found("compressor", format!("{id:#04x}")))?;
        self.compressors
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("compressor", name.clone()))
    }

    /// Resolve a serializer from the id carried in a frame header.
    pub fn load_serializer(&self, id: u8) -> RpcResult<Arc<dyn Serializer>> {
        let name = self
            .serializer_names
            .get(&id)
            .ok_or_else(|| not_found("serializer", format!("{id:#04x}")))?;
        self.serializers
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("serializer", name.clone()))
    }

    /// Wire id of a registered compressor, by configuration name.
    pub fn compressor_id(&self, name: &str) -> RpcResult<u8> {
        if !self.compressors.contains_key(name) {
            return Err(not_found("compressor", name.to_string()));
        }
        self.compressor_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| not_found("compressor", name.to_string()))
    }

    pub fn serializer_id(&self, name: &str) -> RpcResult<u8> {
        if !self.serializers.contains_key(name) {
            return Err(not_found("serializer", name.to_string()));
        }
        self.serializer_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| not_found("serializer", name.to_string()))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn not_found(kind: &'static str, name: String) -> RpcError {
    RpcError::CodecNotFound { kind, name }
}
