//! one bitcoin node backend.
//!
//! Every operation opens a fresh `Connection: close` socket to the
//! address resolved at construction time, so no name resolution happens
//! once the worker is serving (or sandboxed). The response is collected
//! to EOF, parsed as HTTP, then as a JSON-RPC envelope.

use core::cell::{Cell, RefCell};
use core::net::SocketAddr;
use core::time::Duration;

use std::fs;
use std::net::ToSocketAddrs;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::chain::Chain;
use crate::config::RpcConfig;
use crate::metrics::inc;

use super::RpcError;

/// Responses past this size abort the operation.
pub const RPC_MAX_RESPONSE: usize = 4 * 1024 * 1024;

const MAX_RESPONSE_HEADERS: usize = 32;

pub struct RpcClient {
    chain: Chain,
    host: String,
    port: u16,
    addr: SocketAddr,
    auth_header: RefCell<String>,
    cookie_path: Option<PathBuf>,
    wallet: Option<String>,
    timeout: Duration,

    next_id: Cell<u64>,
    pub request_count: Cell<u64>,
    pub error_count: Cell<u64>,
    pub available: Cell<bool>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn basic_auth(credentials: &str) -> String {
    format!("Basic {}", BASE64.encode(credentials.as_bytes()))
}

fn read_cookie(path: &PathBuf) -> Result<String, RpcError> {
    let text = fs::read_to_string(path).map_err(|e| RpcError::Cookie(e.to_string()))?;
    let line = text
        .lines()
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RpcError::Cookie(String::from("empty cookie file")))?;
    Ok(basic_auth(line))
}

impl RpcClient {
    pub fn new(config: &RpcConfig, chain: Chain) -> Result<Self, RpcError> {
        // resolve now; the worker may lose DNS access later.
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| RpcError::Connect(e.to_string()))?
            .next()
            .ok_or_else(|| RpcError::Connect(format!("{} resolves to nothing", config.host)))?;

        let cookie_path = config.cookie_file.clone().or_else(|| {
            config.datadir.as_ref().map(|datadir| {
                let subdir = chain.cookie_subdir();
                if subdir.is_empty() {
                    datadir.join(".cookie")
                } else {
                    datadir.join(subdir).join(".cookie")
                }
            })
        });

        let auth_header = match &cookie_path {
            Some(path) => read_cookie(path)?,
            None => {
                if config.user.is_empty() || config.password.is_empty() {
                    return Err(RpcError::Auth);
                }
                basic_auth(&format!("{}:{}", config.user, config.password))
            }
        };

        Ok(Self {
            chain,
            host: config.host.clone(),
            port: config.port,
            addr,
            auth_header: RefCell::new(auth_header),
            cookie_path,
            wallet: config.wallet.clone(),
            timeout: config.timeout,
            next_id: Cell::new(0),
            request_count: Cell::new(0),
            error_count: Cell::new(0),
            available: Cell::new(false),
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Re-read the cookie file; bitcoind rewrites it on restart.
    pub fn refresh_cookie(&self) -> Result<(), RpcError> {
        let Some(path) = &self.cookie_path else {
            return Ok(());
        };
        *self.auth_header.borrow_mut() = read_cookie(path)?;
        debug!("rpc: refreshed cookie auth for {}", self.chain);
        Ok(())
    }

    fn request_target(&self) -> String {
        match &self.wallet {
            Some(wallet) => format!("/wallet/{wallet}"),
            None => String::from("/"),
        }
    }

    async fn round_trip(&self, body: &[u8]) -> Result<(u16, Vec<u8>), RpcError> {
        let head = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Authorization: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.request_target(),
            self.host,
            self.port,
            self.auth_header.borrow(),
            body.len(),
        );

        let mut stream = timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Connect(e.to_string()))?;

        timeout(self.timeout, async {
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(body).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| RpcError::Timeout)?
        .map_err(|e| RpcError::Connect(e.to_string()))?;

        let mut response = Vec::with_capacity(8 * 1024);
        loop {
            let n = timeout(self.timeout, stream.read_buf(&mut response))
                .await
                .map_err(|_| RpcError::Timeout)?
                .map_err(|e| RpcError::Connect(e.to_string()))?;
            if n == 0 {
                break;
            }
            if response.len() > RPC_MAX_RESPONSE {
                return Err(RpcError::Oversize);
            }
        }

        if response.is_empty() {
            return Err(RpcError::Connect(String::from("node closed without responding")));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(&response) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(RpcError::Parse(String::from("truncated http response")));
            }
            Err(e) => return Err(RpcError::Parse(e.to_string())),
        };
        let status = parsed
            .code
            .ok_or_else(|| RpcError::Parse(String::from("missing status code")))?;

        Ok((status, response.split_off(head_len)))
    }

    /// One JSON-RPC call with the single cookie-reauth retry. The
    /// overall deadline bounds the whole exchange including the retry.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.get().wrapping_add(1);
        self.next_id.set(id);

        let request = serde_json::json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::Parse(e.to_string()))?;

        inc(&self.request_count);

        let deadline = self.timeout.saturating_mul(2);
        let outcome = timeout(deadline, self.call_with_reauth(&body))
            .await
            .unwrap_or(Err(RpcError::Timeout));

        match outcome {
            Err(e) => {
                inc(&self.error_count);
                if !matches!(e, RpcError::Node(_)) {
                    self.available.set(false);
                }
                Err(e)
            }
            Ok(value) => {
                self.available.set(true);
                Ok(value)
            }
        }
    }

    async fn call_with_reauth(&self, body: &[u8]) -> Result<Value, RpcError> {
        let mut auth_retried = false;
        let payload = loop {
            let (status, payload) = self.round_trip(body).await?;
            if status == 401 || status == 403 {
                if !auth_retried && self.cookie_path.is_some() {
                    info!("rpc: auth failed for {}, refreshing cookie", self.chain);
                    auth_retried = true;
                    self.refresh_cookie()?;
                    continue;
                }
                return Err(RpcError::Auth);
            }
            break payload;
        };

        let envelope: Envelope =
            serde_json::from_slice(&payload).map_err(|e| RpcError::Parse(e.to_string()))?;

        if let Some(error) = envelope.error {
            if !error.is_null() {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| error.to_string());
                return Err(RpcError::Node(message));
            }
        }

        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// Broadcast a raw transaction; returns the txid on acceptance.
    pub async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        let result = self.call("sendrawtransaction", serde_json::json!([hex])).await?;
        let txid = match result {
            Value::String(txid) => txid,
            other => other.to_string(),
        };
        info!("rpc: broadcast tx -> {} ({:.16}...)", self.chain, txid);
        Ok(txid)
    }

    /// getblockchaininfo probe; flips the availability bit.
    pub async fn test_connection(&self) -> bool {
        self.call("getblockchaininfo", serde_json::json!([])).await.is_ok()
    }
}
