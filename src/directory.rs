//! Resolution of a peer's public keys and key revision.

use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::config::KeyDirectoryConfig;
use crate::error::AmesError;
use crate::ship::{Life, Ship};

/// ABI selector of `points(uint32)` on the Azimuth contract
const POINTS_SELECTOR: &str = "63fa9a87";
const WORD_LEN: usize = 32;
/// index of `keyRevisionNumber` among the words returned by `points()`
const KEY_REVISION_WORD: usize = 8;

/// A peer's public key material. Keys are stored as little-endian atom bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerKeys {
    pub encryption_key: [u8; 32],
    pub authentication_key: [u8; 32],
    pub life: Life,
}

impl PeerKeys {
    /// Parses keys given as big-endian hex strings, as published on chain
    pub fn from_hex(encryption_key: &str, authentication_key: &str, life: Life) -> anyhow::Result<PeerKeys> {
        Ok(PeerKeys {
            encryption_key: key_from_hex(encryption_key)?,
            authentication_key: key_from_hex(authentication_key)?,
            life,
        })
    }
}

fn key_from_hex(key: &str) -> anyhow::Result<[u8; 32]> {
    let key = key.strip_prefix("0x").unwrap_or(key);
    let mut bytes = hex::decode(key)
        .map_err(|e| AmesError::KeyLookup(format!("malformed key {}: {}", key, e)))?;
    if bytes.len() != WORD_LEN {
        return Err(AmesError::KeyLookup(format!("key has {} bytes, expected {}", bytes.len(), WORD_LEN)).into());
    }
    bytes.reverse();

    let mut result = [0u8; 32];
    result.copy_from_slice(&bytes);
    Ok(result)
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyDirectory: Send + Sync + 'static {
    async fn lookup(&self, ship: Ship) -> anyhow::Result<PeerKeys>;
}

/// Pre-provisioned keys, e.g. for peers that are not registered on chain
#[derive(Default)]
pub struct StaticKeyDirectory {
    keys: RwLock<FxHashMap<Ship, PeerKeys>>,
}

impl StaticKeyDirectory {
    pub fn new() -> StaticKeyDirectory {
        Default::default()
    }

    pub fn insert(&self, ship: Ship, keys: PeerKeys) {
        self.keys.write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ship, keys);
    }
}

#[async_trait]
impl KeyDirectory for StaticKeyDirectory {
    async fn lookup(&self, ship: Ship) -> anyhow::Result<PeerKeys> {
        self.keys.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ship)
            .cloned()
            .ok_or_else(|| AmesError::KeyLookup(format!("no keys for {}", ship)).into())
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Looks up keys in the Azimuth PKI by calling `points(uint32)` on an Ethereum node's JSON-RPC
///  endpoint.
pub struct JsonRpcKeyDirectory {
    config: KeyDirectoryConfig,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl JsonRpcKeyDirectory {
    pub fn new(config: KeyDirectoryConfig) -> JsonRpcKeyDirectory {
        JsonRpcKeyDirectory {
            config,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    fn request_body(&self, point: u32) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                {
                    "to": self.config.contract,
                    "data": format!("0x{}{:064x}", POINTS_SELECTOR, point),
                },
                "latest",
            ],
        }).to_string()
    }

    async fn call(&self, body: String) -> anyhow::Result<Bytes> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.config.rpc_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = self.client.request(request).await
            .map_err(|e| AmesError::KeyLookup(format!("request to {} failed: {}", self.config.rpc_url, e)))?;
        let status = response.status();
        let body = response.into_body().collect().await
            .map_err(|e| AmesError::KeyLookup(format!("error reading response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(AmesError::KeyLookup(format!("HTTP status {}", status)).into());
        }
        Ok(body)
    }
}

/// Decodes the ABI encoded return value of `points()`
pub fn decode_points(result: &str) -> anyhow::Result<PeerKeys> {
    let raw = hex::decode(result.strip_prefix("0x").unwrap_or(result))
        .map_err(|e| AmesError::KeyLookup(format!("malformed call result: {}", e)))?;
    if raw.len() < (KEY_REVISION_WORD + 1) * WORD_LEN {
        return Err(AmesError::KeyLookup(format!("call result has only {} bytes", raw.len())).into());
    }

    let word = |i: usize| &raw[i * WORD_LEN..(i + 1) * WORD_LEN];

    let revision = word(KEY_REVISION_WORD);
    if revision[..WORD_LEN - 4].iter().any(|b| *b != 0) {
        return Err(AmesError::KeyLookup("key revision exceeds 32 bits".to_string()).into());
    }
    let life = u32::from_be_bytes([revision[28], revision[29], revision[30], revision[31]]);
    if life == 0 {
        return Err(AmesError::KeyLookup("point has no keys registered".to_string()).into());
    }

    PeerKeys::from_hex(&hex::encode(word(0)), &hex::encode(word(1)), life)
}

#[async_trait]
impl KeyDirectory for JsonRpcKeyDirectory {
    async fn lookup(&self, ship: Ship) -> anyhow::Result<PeerKeys> {
        let point = u32::try_from(ship.0)
            .map_err(|_| AmesError::KeyLookup(format!("{} is not registered on chain", ship)))?;

        debug!(%ship, "looking up keys");
        let body = self.call(self.request_body(point)).await?;
        trace!("JSON-RPC response: {}", String::from_utf8_lossy(&body));

        let response: RpcResponse = serde_json::from_slice(&body)
            .map_err(|e| AmesError::KeyLookup(format!("malformed JSON-RPC response: {}", e)))?;
        if let Some(err) = response.error {
            return Err(AmesError::KeyLookup(format!("JSON-RPC error {}: {}", err.code, err.message)).into());
        }
        let result = response.result
            .ok_or_else(|| AmesError::KeyLookup("JSON-RPC response without result".to_string()))?;

        decode_points(&result)
    }
}
