//! path-shape classification.
//!
//! The router never allocates and never inspects anything past the path
//! string. Hex shape decides between txid lookup and raw transaction
//! broadcast; everything else is a fixed route set.

use crate::hex::is_all_hex;

/// 32 byte txid rendered as hex.
pub const TXID_HEX_LEN: usize = 64;

/// Smallest raw transaction accepted for broadcast (82 bytes as hex).
pub const MIN_TX_HEX_LEN: usize = 164;

pub const ACME_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Home,
    Health,
    Ready,
    Alive,
    Version,
    Metrics,
    Docs,
    Status,
    Logos,
    AcmeChallenge,
    Result,
    Broadcast,
    Error,
}

impl Route {
    pub const COUNT: usize = 13;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Route::Home => "/",
            Route::Health => "/health",
            Route::Ready => "/ready",
            Route::Alive => "/alive",
            Route::Version => "/version",
            Route::Metrics => "/metrics",
            Route::Docs => "/docs",
            Route::Status => "/status",
            Route::Logos => "/logos",
            Route::AcmeChallenge => "/acme",
            Route::Result => "/result",
            Route::Broadcast => "/broadcast",
            Route::Error => "/error",
        }
    }
}

pub fn route_path(path: &str) -> Route {
    let Some(content) = path.strip_prefix('/') else {
        return Route::Error;
    };

    if content.is_empty() {
        return Route::Home;
    }

    match content {
        "health" => return Route::Health,
        "ready" => return Route::Ready,
        "alive" => return Route::Alive,
        "version" => return Route::Version,
        "metrics" => return Route::Metrics,
        "docs" => return Route::Docs,
        "status" => return Route::Status,
        "logos" => return Route::Logos,
        _ => {}
    }

    if let Some(token) = path.strip_prefix(ACME_PREFIX) {
        if !token.is_empty() {
            return Route::AcmeChallenge;
        }
        return Route::Error;
    }

    // /tx/{txid} only accepts exactly 64 hex characters.
    if let Some(txid) = content.strip_prefix("tx/") {
        if txid.len() == TXID_HEX_LEN && is_all_hex(txid.as_bytes()) {
            return Route::Result;
        }
        return Route::Error;
    }

    if !is_all_hex(content.as_bytes()) {
        return Route::Error;
    }

    // the tail represents bytes, so an odd count can never be valid.
    if content.len() % 2 != 0 {
        return Route::Error;
    }

    if content.len() == TXID_HEX_LEN {
        return Route::Result;
    }

    if content.len() >= MIN_TX_HEX_LEN {
        return Route::Broadcast;
    }

    Route::Error
}
