//! async json-rpc to bitcoin nodes.

mod client;

pub use client::{RpcClient, RPC_MAX_RESPONSE};

use core::cell::Cell;
use core::fmt;

use std::error;

use tracing::{info, warn};

use crate::chain::{Chain, ChainMode};
use crate::config::Config;
use crate::metrics::inc;

/// Completion taxonomy of one RPC operation.
#[derive(Debug)]
pub enum RpcError {
    /// Connect, send or receive failed.
    Connect(String),
    /// 401/403 that survived the single cookie-refresh retry.
    Auth,
    /// Per-operation timeout or overall deadline hit.
    Timeout,
    /// Response was not parseable HTTP + JSON-RPC.
    Parse(String),
    /// The node answered with a JSON-RPC error object.
    Node(String),
    /// Response grew past [RPC_MAX_RESPONSE].
    Oversize,
    /// Cookie file could not be read.
    Cookie(String),
    /// The request was torn down before completion.
    Cancelled,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Connect(detail) => write!(f, "failed to reach node: {detail}"),
            RpcError::Auth => f.write_str("node authentication failed"),
            RpcError::Timeout => f.write_str("node request timed out"),
            RpcError::Parse(detail) => write!(f, "unparseable node response: {detail}"),
            RpcError::Node(message) => write!(f, "node rejected request: {message}"),
            RpcError::Oversize => f.write_str("node response too large"),
            RpcError::Cookie(detail) => write!(f, "cookie file unreadable: {detail}"),
            RpcError::Cancelled => f.write_str("request cancelled"),
        }
    }
}

impl error::Error for RpcError {}

/// Per-chain clients plus broadcast bookkeeping. In mixed mode a
/// broadcast walks the enabled backends in chain order until one
/// accepts; the transaction itself is never parsed to pick a backend.
pub struct RpcManager {
    clients: Vec<RpcClient>,
    mode: ChainMode,
    pub total_broadcasts: Cell<u64>,
    pub successful_broadcasts: Cell<u64>,
    pub failed_broadcasts: Cell<u64>,
}

impl RpcManager {
    /// Build clients for every enabled `[rpc.<chain>]` section. A
    /// section that fails to initialise (unresolvable host, unreadable
    /// cookie) is logged and skipped so one bad backend does not take
    /// the worker down.
    pub fn new(config: &Config) -> Self {
        let mut clients = Vec::new();
        for (chain, rpc_config) in config.rpc.enabled() {
            match RpcClient::new(rpc_config, chain) {
                Ok(client) => {
                    info!("rpc: initialised {chain} client -> {}:{}", client.host(), client.port());
                    clients.push(client);
                }
                Err(e) => warn!("rpc: skipping {chain} backend: {e}"),
            }
        }
        if clients.is_empty() {
            warn!("rpc: no backend configured, broadcasting disabled");
        }
        Self {
            clients,
            mode: config.chain,
            total_broadcasts: Cell::new(0),
            successful_broadcasts: Cell::new(0),
            failed_broadcasts: Cell::new(0),
        }
    }

    pub fn clients(&self) -> &[RpcClient] {
        &self.clients
    }

    pub fn client_for(&self, chain: Chain) -> Option<&RpcClient> {
        self.clients.iter().find(|c| c.chain() == chain)
    }

    /// Forward a raw transaction to the backend(s) for the configured
    /// chain mode. Returns the txid reported by the accepting node.
    pub async fn broadcast(&self, hex: &str) -> Result<String, RpcError> {
        inc(&self.total_broadcasts);

        let result = match self.mode {
            ChainMode::Single(chain) => match self.client_for(chain) {
                Some(client) => client.send_raw_transaction(hex).await,
                None => Err(RpcError::Connect(format!("no rpc backend configured for {chain}"))),
            },
            ChainMode::Mixed => {
                let mut last = RpcError::Connect(String::from("no rpc backend configured"));
                let mut sent = None;
                for client in &self.clients {
                    match client.send_raw_transaction(hex).await {
                        Ok(txid) => {
                            sent = Some(txid);
                            break;
                        }
                        Err(e) => last = e,
                    }
                }
                sent.ok_or(last)
            }
        };

        match &result {
            Ok(_) => inc(&self.successful_broadcasts),
            Err(_) => inc(&self.failed_broadcasts),
        }
        result
    }

    /// Probe every backend once and log its status. Run at worker
    /// startup before the listeners go live.
    pub async fn probe_and_log(&self) {
        if self.mode == ChainMode::Mixed && !self.clients.is_empty() {
            info!("mixed mode: probing all enabled rpc backends");
        }
        for client in &self.clients {
            if client.test_connection().await {
                info!("rpc: {} connection ok ({}:{})", client.chain(), client.host(), client.port());
            } else {
                warn!("rpc: {} connection failed ({}:{})", client.chain(), client.host(), client.port());
            }
        }
    }
}
