//! bitcoin network identity.

use core::fmt;
use core::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Chain {
    pub const ALL: [Chain; 4] = [Chain::Mainnet, Chain::Testnet, Chain::Signet, Chain::Regtest];

    pub const fn name(self) -> &'static str {
        match self {
            Chain::Mainnet => "mainnet",
            Chain::Testnet => "testnet",
            Chain::Signet => "signet",
            Chain::Regtest => "regtest",
        }
    }

    /// Subdirectory of a bitcoind datadir holding the `.cookie` file.
    pub const fn cookie_subdir(self) -> &'static str {
        match self {
            Chain::Mainnet => "",
            Chain::Testnet => "testnet3",
            Chain::Signet => "signet",
            Chain::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `[network] chain` configuration value. Mixed mode keeps several
/// backends enabled and routes each broadcast at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Single(Chain),
    Mixed,
}

impl ChainMode {
    /// Banner spliced into the html pages on test networks; mainnet
    /// and mixed mode serve the pages untouched.
    pub fn banner_html(self) -> Option<&'static str> {
        match self {
            ChainMode::Single(Chain::Testnet) => Some(
                "<div class=\"network-banner network-banner-testnet\">TESTNET - Coins have no value</div>",
            ),
            ChainMode::Single(Chain::Signet) => Some(
                "<div class=\"network-banner network-banner-signet\">SIGNET - Coins have no value</div>",
            ),
            ChainMode::Single(Chain::Regtest) => Some(
                "<div class=\"network-banner network-banner-regtest\">REGTEST - Local test network</div>",
            ),
            _ => None,
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainMode::Single(chain) => fmt::Display::fmt(chain, f),
            ChainMode::Mixed => f.write_str("mixed"),
        }
    }
}

impl FromStr for ChainMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => ChainMode::Single(Chain::Mainnet),
            "testnet" | "testnet3" | "test" => ChainMode::Single(Chain::Testnet),
            "signet" => ChainMode::Single(Chain::Signet),
            "regtest" | "reg" => ChainMode::Single(Chain::Regtest),
            "mixed" | "multi" | "multichain" => ChainMode::Mixed,
            _ => return Err(()),
        };
        Ok(mode)
    }
}
