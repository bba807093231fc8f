//! INI configuration.
//!
//! Malformed values warn and fall back to their defaults; only a
//! missing or unknown `[network] chain` is fatal, because routing a
//! broadcast to the wrong network is not a recoverable default.

use core::fmt;
use core::time::Duration;

use std::collections::HashMap;
use std::error;
use std::path::{Path, PathBuf};

use config::{FileFormat, Source};

use crate::chain::{Chain, ChainMode};

type Sections = HashMap<String, HashMap<String, String>>;

pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_TIER_LARGE_THRESHOLD: usize = 64 * 1024;
pub const DEFAULT_TIER_HUGE_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub initial_buffer_size: usize,
    pub max_buffer_size: usize,
    pub tier_large_threshold: usize,
    pub tier_huge_threshold: usize,
    pub listen_port: u16,
    pub max_connections: u32,
    pub read_timeout: Duration,
    pub static_dir: PathBuf,
    pub cache_max_age: u32,
    pub slots_normal_max: u32,
    pub slots_large_max: u32,
    pub slots_huge_max: u32,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub tls: TlsSettings,
    pub json_logging: bool,
    pub verbose: bool,
    pub acme_challenge_dir: PathBuf,
    pub blocklist_file: Option<PathBuf>,
    pub allowlist_file: Option<PathBuf>,
    pub seccomp: bool,
    pub chain: ChainMode,
    pub rpc: RpcSettings,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub enabled: bool,
    pub port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub http2_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RpcSettings {
    pub mainnet: Option<RpcConfig>,
    pub testnet: Option<RpcConfig>,
    pub signet: Option<RpcConfig>,
    pub regtest: Option<RpcConfig>,
}

impl RpcSettings {
    pub fn get(&self, chain: Chain) -> Option<&RpcConfig> {
        match chain {
            Chain::Mainnet => self.mainnet.as_ref(),
            Chain::Testnet => self.testnet.as_ref(),
            Chain::Signet => self.signet.as_ref(),
            Chain::Regtest => self.regtest.as_ref(),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = (Chain, &RpcConfig)> {
        Chain::ALL
            .into_iter()
            .filter_map(|chain| self.get(chain).filter(|cfg| cfg.enabled).map(|cfg| (chain, cfg)))
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub cookie_file: Option<PathBuf>,
    pub datadir: Option<PathBuf>,
    pub timeout: Duration,
    pub wallet: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingChain,
    InvalidChain(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingChain => f.write_str("[network] chain is required"),
            ConfigError::InvalidChain(value) => {
                write!(f, "unknown [network] chain value {value:?}")
            }
        }
    }
}

impl error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            tier_large_threshold: DEFAULT_TIER_LARGE_THRESHOLD,
            tier_huge_threshold: DEFAULT_TIER_HUGE_THRESHOLD,
            listen_port: 8080,
            max_connections: 100,
            read_timeout: Duration::from_secs(30),
            static_dir: PathBuf::from("./static"),
            cache_max_age: 3600,
            slots_normal_max: 100,
            slots_large_max: 20,
            slots_huge_max: 5,
            rate_limit_rps: 100.0,
            rate_limit_burst: 200.0,
            tls: TlsSettings {
                enabled: false,
                port: 8443,
                cert_file: PathBuf::new(),
                key_file: PathBuf::new(),
                http2_enabled: true,
            },
            json_logging: false,
            verbose: false,
            acme_challenge_dir: PathBuf::from(".well-known/acme-challenge"),
            blocklist_file: None,
            allowlist_file: None,
            seccomp: false,
            chain: ChainMode::Single(Chain::Mainnet),
            rpc: RpcSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let sections = match read_sections(path) {
            Ok(sections) => sections,
            Err(e) => {
                eprintln!("warning: cannot load config file {}: {e}; using defaults", path.display());
                Sections::default()
            }
        };
        Config::from_sections(&sections)
    }

    pub fn from_sections(sections: &Sections) -> Result<Config, ConfigError> {
        let mut c = Config::default();

        c.initial_buffer_size = lookup(sections, "buffer", "initial_size", c.initial_buffer_size);
        c.max_buffer_size = lookup(sections, "buffer", "max_size", c.max_buffer_size);

        c.tier_large_threshold = lookup(sections, "tiers", "large_threshold", c.tier_large_threshold);
        c.tier_huge_threshold = lookup(sections, "tiers", "huge_threshold", c.tier_huge_threshold);

        c.listen_port = lookup(sections, "server", "port", c.listen_port);
        c.max_connections = lookup(sections, "server", "max_connections", c.max_connections);
        c.read_timeout =
            Duration::from_secs(lookup(sections, "server", "read_timeout", c.read_timeout.as_secs()));

        if let Some(dir) = get(sections, "static", "dir") {
            c.static_dir = PathBuf::from(dir);
        }
        c.cache_max_age = lookup(sections, "static", "cache_max_age", c.cache_max_age);

        c.slots_normal_max = lookup(sections, "slots", "normal_max", c.slots_normal_max);
        c.slots_large_max = lookup(sections, "slots", "large_max", c.slots_large_max);
        c.slots_huge_max = lookup(sections, "slots", "huge_max", c.slots_huge_max);

        c.rate_limit_rps = lookup(sections, "ratelimit", "rps", c.rate_limit_rps);
        c.rate_limit_burst = lookup(sections, "ratelimit", "burst", c.rate_limit_burst);

        c.tls.enabled = lookup_flag(sections, "tls", "enabled", c.tls.enabled);
        c.tls.port = lookup(sections, "tls", "port", c.tls.port);
        if let Some(file) = get(sections, "tls", "cert_file") {
            c.tls.cert_file = PathBuf::from(file);
        }
        if let Some(file) = get(sections, "tls", "key_file") {
            c.tls.key_file = PathBuf::from(file);
        }
        c.tls.http2_enabled = lookup_flag(sections, "tls", "http2_enabled", c.tls.http2_enabled);

        c.json_logging = lookup_flag(sections, "logging", "json", c.json_logging);
        c.verbose = lookup_flag(sections, "logging", "verbose", c.verbose);

        if let Some(dir) = get(sections, "acme", "challenge_dir") {
            c.acme_challenge_dir = PathBuf::from(dir);
        }

        c.blocklist_file = get(sections, "security", "blocklist_file")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        c.allowlist_file = get(sections, "security", "allowlist_file")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        c.seccomp = lookup_flag(sections, "security", "seccomp", c.seccomp);

        c.chain = match get(sections, "network", "chain") {
            None => return Err(ConfigError::MissingChain),
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidChain(value.to_owned()))?,
        };

        c.rpc = RpcSettings {
            mainnet: rpc_section(sections, Chain::Mainnet),
            testnet: rpc_section(sections, Chain::Testnet),
            signet: rpc_section(sections, Chain::Signet),
            regtest: rpc_section(sections, Chain::Regtest),
        };

        if c.tier_large_threshold >= c.tier_huge_threshold {
            eprintln!("warning: tier large_threshold >= huge_threshold; adjusting huge to 2x large");
            c.tier_huge_threshold = c.tier_large_threshold * 2;
        }

        Ok(c)
    }
}

fn default_rpc_port(chain: Chain) -> u16 {
    match chain {
        Chain::Mainnet => 8332,
        Chain::Testnet => 18332,
        Chain::Signet => 38332,
        Chain::Regtest => 18443,
    }
}

fn rpc_section(sections: &Sections, chain: Chain) -> Option<RpcConfig> {
    let name = format!("rpc.{chain}");
    let section = sections.get(&name)?;

    let lookup_local = |key: &str, default: String| -> String {
        section.get(key).cloned().unwrap_or(default)
    };

    let cfg = RpcConfig {
        enabled: lookup_flag(sections, &name, "enabled", false),
        host: lookup_local("host", String::from("127.0.0.1")),
        port: lookup(sections, &name, "port", default_rpc_port(chain)),
        user: lookup_local("user", String::new()),
        password: lookup_local("password", String::new()),
        cookie_file: section
            .get("cookie_file")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
        datadir: section
            .get("datadir")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
        timeout: Duration::from_secs(lookup(sections, &name, "timeout", 30u64)),
        wallet: section.get("wallet").filter(|v| !v.is_empty()).cloned(),
    };
    Some(cfg)
}

fn read_sections(path: &Path) -> Result<Sections, config::ConfigError> {
    // Collected directly from the `File` source (rather than through a
    // `ConfigBuilder`) because the builder's merge step treats any `.` in a
    // top-level key as a nested-path separator, which would shred section
    // names like `rpc.mainnet` into a nested `rpc: { mainnet: ... }` table.
    let name = path
        .to_str()
        .ok_or_else(|| config::ConfigError::Message(String::from("non-utf8 config path")))?;
    config::File::new(name, FileFormat::Ini)
        .collect()?
        .into_iter()
        .map(|(section, value)| Ok((section, value.try_deserialize::<HashMap<String, String>>()?)))
        .collect()
}

fn get<'a>(sections: &'a Sections, section: &str, key: &str) -> Option<&'a str> {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .map(String::as_str)
}

fn lookup<T>(sections: &Sections, section: &str, key: &str, default: T) -> T
where
    T: core::str::FromStr + fmt::Display,
{
    match get(sections, section, key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                eprintln!("warning: invalid value {raw:?} for [{section}] {key}, using default {default}");
                default
            }
        },
    }
}

fn lookup_flag(sections: &Sections, section: &str, key: &str, default: bool) -> bool {
    match get(sections, section, key) {
        None => default,
        Some(raw) => match raw.trim() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                eprintln!("warning: invalid value {other:?} for [{section}] {key}, using default {default}");
                default
            }
        },
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "buffer: initial={} max={}", self.initial_buffer_size, self.max_buffer_size)?;
        writeln!(
            f,
            "tiers: large>={} huge>={}",
            self.tier_large_threshold, self.tier_huge_threshold
        )?;
        writeln!(
            f,
            "server: port={} max_connections={} read_timeout={}s",
            self.listen_port,
            self.max_connections,
            self.read_timeout.as_secs()
        )?;
        writeln!(
            f,
            "static: dir={} cache_max_age={}s",
            self.static_dir.display(),
            self.cache_max_age
        )?;
        writeln!(
            f,
            "slots: normal={} large={} huge={}",
            self.slots_normal_max, self.slots_large_max, self.slots_huge_max
        )?;
        if self.rate_limit_rps > 0.0 {
            writeln!(f, "ratelimit: rps={} burst={}", self.rate_limit_rps, self.rate_limit_burst)?;
        } else {
            writeln!(f, "ratelimit: disabled")?;
        }
        if self.tls.enabled {
            writeln!(
                f,
                "tls: port={} cert={} key={} http2={}",
                self.tls.port,
                self.tls.cert_file.display(),
                self.tls.key_file.display(),
                self.tls.http2_enabled
            )?;
        } else {
            writeln!(f, "tls: disabled")?;
        }
        writeln!(f, "logging: json={} verbose={}", self.json_logging, self.verbose)?;
        writeln!(f, "acme: challenge_dir={}", self.acme_challenge_dir.display())?;
        writeln!(
            f,
            "security: blocklist={} allowlist={} seccomp={}",
            self.blocklist_file.as_deref().map(Path::display).map(|d| d.to_string()).unwrap_or_else(|| String::from("(none)")),
            self.allowlist_file.as_deref().map(Path::display).map(|d| d.to_string()).unwrap_or_else(|| String::from("(none)")),
            self.seccomp
        )?;
        writeln!(f, "network: chain={}", self.chain)?;
        for (chain, rpc) in self.rpc.enabled() {
            writeln!(f, "rpc.{chain}: {}:{} timeout={}s", rpc.host, rpc.port, rpc.timeout.as_secs())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn load_str(ini: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        file.write_all(ini.as_bytes()).unwrap();
        file.flush().unwrap();
        Config::load(file.path())
    }

    #[test]
    fn chain_is_required() {
        assert!(matches!(load_str(""), Err(ConfigError::MissingChain)));
        assert!(matches!(
            load_str("[network]\nchain = florin\n"),
            Err(ConfigError::InvalidChain(_))
        ));
    }

    #[test]
    fn defaults_apply() {
        let c = load_str("[network]\nchain = regtest\n").unwrap();
        assert_eq!(c.listen_port, 8080);
        assert_eq!(c.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert_eq!(c.slots_normal_max, 100);
        assert_eq!(c.chain, ChainMode::Single(Chain::Regtest));
        assert!(!c.tls.enabled);
        assert!(c.rpc.enabled().next().is_none());
    }

    #[test]
    fn sections_parse() {
        let c = load_str(
            "[network]\nchain = mixed\n\
             [server]\nport = 9000\nread_timeout = 10\n\
             [buffer]\nmax_size = 1048576\n\
             [tiers]\nlarge_threshold = 1000\nhuge_threshold = 5000\n\
             [slots]\nnormal_max = 7\nlarge_max = 3\nhuge_max = 1\n\
             [ratelimit]\nrps = 5.5\nburst = 11\n\
             [tls]\nenabled = 1\nport = 9443\ncert_file = /tmp/c.pem\nkey_file = /tmp/k.pem\nhttp2_enabled = 0\n\
             [logging]\njson = 1\nverbose = 1\n\
             [security]\nblocklist_file = /tmp/block.txt\nseccomp = 1\n",
        )
        .unwrap();
        assert_eq!(c.chain, ChainMode::Mixed);
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.read_timeout, Duration::from_secs(10));
        assert_eq!(c.max_buffer_size, 1 << 20);
        assert_eq!(c.tier_large_threshold, 1000);
        assert_eq!(c.tier_huge_threshold, 5000);
        assert_eq!((c.slots_normal_max, c.slots_large_max, c.slots_huge_max), (7, 3, 1));
        assert_eq!(c.rate_limit_rps, 5.5);
        assert_eq!(c.rate_limit_burst, 11.0);
        assert!(c.tls.enabled);
        assert_eq!(c.tls.port, 9443);
        assert!(!c.tls.http2_enabled);
        assert!(c.json_logging && c.verbose);
        assert_eq!(c.blocklist_file.as_deref(), Some(Path::new("/tmp/block.txt")));
        assert!(c.seccomp);
    }

    #[test]
    fn rpc_sections_parse() {
        let c = load_str(
            "[network]\nchain = mixed\n\
             [rpc.mainnet]\nenabled = 1\nhost = node-a\nuser = rpc\npassword = hunter2\nwallet = relay\n\
             [rpc.regtest]\nenabled = 1\ncookie_file = /tmp/.cookie\ntimeout = 5\n\
             [rpc.signet]\nenabled = 0\nhost = node-c\n",
        )
        .unwrap();

        let mainnet = c.rpc.mainnet.as_ref().unwrap();
        assert!(mainnet.enabled);
        assert_eq!(mainnet.host, "node-a");
        assert_eq!(mainnet.port, 8332);
        assert_eq!(mainnet.user, "rpc");
        assert_eq!(mainnet.wallet.as_deref(), Some("relay"));

        let regtest = c.rpc.regtest.as_ref().unwrap();
        assert_eq!(regtest.port, 18443);
        assert_eq!(regtest.cookie_file.as_deref(), Some(Path::new("/tmp/.cookie")));
        assert_eq!(regtest.timeout, Duration::from_secs(5));

        assert!(!c.rpc.signet.as_ref().unwrap().enabled);
        let enabled: Vec<Chain> = c.rpc.enabled().map(|(chain, _)| chain).collect();
        assert_eq!(enabled, vec![Chain::Mainnet, Chain::Regtest]);
    }

    #[test]
    fn bad_values_fall_back_with_warning() {
        let c = load_str(
            "[network]\nchain = mainnet\n[server]\nport = seventy\n[slots]\nnormal_max = -4\n",
        )
        .unwrap();
        assert_eq!(c.listen_port, 8080);
        assert_eq!(c.slots_normal_max, 100);
    }

    #[test]
    fn tier_ordering_repaired() {
        let c = load_str(
            "[network]\nchain = mainnet\n[tiers]\nlarge_threshold = 5000\nhuge_threshold = 100\n",
        )
        .unwrap();
        assert_eq!(c.tier_huge_threshold, 10_000);
    }

    #[test]
    fn missing_file_is_still_chain_checked() {
        let err = Config::load(Path::new("/nonexistent/txrelay.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingChain));
    }
}
