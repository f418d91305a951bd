//! Electrum protocol client (electrs, Fulcrum, ElectrumX).
//!
//! Line-delimited JSON-RPC 2.0 over plain TCP. A small pool of connections
//! is shared by all sessions; each request holds one connection for its
//! round trip. Any transport failure drops that connection and the next
//! call through its slot reconnects.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{verbose, ChainDataProvider, ProviderError, ProviderHealth, RpcResponse};
use crate::types::Transaction;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const CLIENT_NAME: &str = "satoshi-tracer";
const PROTOCOL_MIN: &str = "1.4";
const PROTOCOL_MAX: &str = "1.4.2";
pub const DEFAULT_POOL_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct ElectrsClient {
    host: String,
    port: u16,
    timeout: Duration,
    pool: Vec<Mutex<Option<Connection>>>,
    next_slot: AtomicUsize,
    server_version: std::sync::Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl ElectrsClient {
    pub fn new(host: &str, port: u16, timeout_secs: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            pool: (0..DEFAULT_POOL_SIZE).map(|_| Mutex::new(None)).collect(),
            next_slot: AtomicUsize::new(0),
            server_version: std::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of connections opened lazily and shared across sessions.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool = (0..size.max(1)).map(|_| Mutex::new(None)).collect();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open a connection and negotiate the protocol version.
    async fn connect(&self) -> Result<Connection, ProviderError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| ProviderError::Unavailable(format!("connect to {} timed out", self.endpoint())))?
            .map_err(|e| ProviderError::Unavailable(format!("connect to {}: {e}", self.endpoint())))?;

        let (read, write) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read),
            writer: write,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = tokio::time::timeout(
            self.timeout,
            exchange(&mut conn, id, "server.version", json!([CLIENT_NAME, [PROTOCOL_MIN, PROTOCOL_MAX]])),
        )
        .await
        .map_err(|_| ProviderError::Unavailable("server.version timed out".to_string()))??;

        let version = response.into_result()?;
        info!(endpoint = %self.endpoint(), server = %version, "Connected to Electrum server");
        if let Ok(mut slot) = self.server_version.lock() {
            *slot = Some(version.to_string());
        }

        Ok(conn)
    }

    /// An idle pool slot if there is one, otherwise wait on the next slot
    /// in rotation.
    async fn checkout(&self) -> MutexGuard<'_, Option<Connection>> {
        for slot in &self.pool {
            if let Ok(guard) = slot.try_lock() {
                return guard;
            }
        }
        let i = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[i].lock().await
    }

    /// Issue one request, reconnecting first if needed.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let mut guard = self.checkout().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "Electrum request");

        match tokio::time::timeout(self.timeout, exchange(&mut conn, id, method, params)).await {
            Ok(Ok(response)) => {
                *guard = Some(conn);
                response.into_result()
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint(), method, error = %e, "Electrum connection dropped");
                Err(e)
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint(), method, "Electrum request timed out");
                Err(ProviderError::Unavailable(format!("{method} timed out")))
            }
        }
    }
}

/// Write one request line and read lines until the matching response.
async fn exchange(
    conn: &mut Connection,
    id: u64,
    method: &str,
    params: Value,
) -> Result<RpcResponse, ProviderError> {
    let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    let mut line = request.to_string();
    line.push('\n');

    conn.writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ProviderError::Unavailable(format!("write failed: {e}")))?;
    conn.writer
        .flush()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("flush failed: {e}")))?;

    loop {
        let mut buf = String::new();
        let n = conn
            .reader
            .read_line(&mut buf)
            .await
            .map_err(|e| ProviderError::Unavailable(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(ProviderError::Unavailable("connection closed by server".to_string()));
        }

        let response: RpcResponse = serde_json::from_str(buf.trim())
            .map_err(|e| ProviderError::Unavailable(format!("malformed response: {e}")))?;

        // Subscription notifications carry no id.
        if response.id.as_ref().and_then(Value::as_u64) == Some(id) {
            return Ok(response);
        }
    }
}

#[async_trait]
impl ChainDataProvider for ElectrsClient {
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError> {
        let value = self.call("blockchain.transaction.get", json!([txid, true])).await?;
        if value.is_string() {
            return Err(ProviderError::Unavailable(
                "server does not support verbose transactions".to_string(),
            ));
        }
        verbose::decode(value).map(Arc::new)
    }

    async fn health(&self) -> ProviderHealth {
        let result = self.call("server.ping", json!([])).await;
        let version = self
            .server_version
            .lock()
            .ok()
            .and_then(|v| v.clone())
            .unwrap_or_else(|| "unknown".to_string());

        match result {
            Ok(_) => ProviderHealth {
                provider: self.name().to_string(),
                healthy: true,
                detail: format!("{} ({version})", self.endpoint()),
            },
            Err(e) => ProviderHealth {
                provider: self.name().to_string(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }

    fn name(&self) -> &'static str {
        "electrs"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
