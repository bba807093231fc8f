//! exact + CIDR ip access lists.
//!
//! Addresses are canonicalised to 16 byte IPv4-mapped IPv6 form before
//! hashing or matching, so `192.168.0.1` and `::ffff:192.168.0.1` are
//! the same key and an IPv4 `/N` becomes an IPv6 `/96+N`.

use core::fmt::Write as _;
use core::net::{IpAddr, Ipv6Addr};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fnv::FnvHashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Block,
    Allow,
    Neutral,
}

pub fn canonical_addr(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn cidr_match(addr: &[u8; 16], network: &[u8; 16], prefix_len: u8) -> bool {
    let full_bytes = (prefix_len / 8) as usize;
    let remaining_bits = prefix_len % 8;

    if addr[..full_bytes] != network[..full_bytes] {
        return false;
    }

    if remaining_bits > 0 && full_bytes < 16 {
        let mask = 0xffu8 << (8 - remaining_bits);
        if (addr[full_bytes] & mask) != (network[full_bytes] & mask) {
            return false;
        }
    }

    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrEntry {
    addr: [u8; 16],
    prefix_len: u8,
}

#[derive(Default)]
pub struct IpAcl {
    exact: FnvHashSet<[u8; 16]>,
    cidr: Vec<CidrEntry>,
    source: Option<PathBuf>,
}

impl IpAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one list line: a bare address or CIDR notation.
    pub fn insert_line(&mut self, line: &str) -> Result<(), &'static str> {
        if let Some((ip_part, prefix_part)) = line.split_once('/') {
            let ip: IpAddr = ip_part.parse().map_err(|_| "invalid address")?;
            let prefix: u8 = prefix_part.parse().map_err(|_| "invalid prefix length")?;
            let (addr, prefix_len) = match ip {
                IpAddr::V4(_) => {
                    if prefix > 32 {
                        return Err("ipv4 prefix out of range");
                    }
                    (canonical_addr(ip), 96 + prefix)
                }
                IpAddr::V6(_) => {
                    if prefix > 128 {
                        return Err("ipv6 prefix out of range");
                    }
                    (canonical_addr(ip), prefix)
                }
            };
            let entry = CidrEntry { addr, prefix_len };
            if !self.cidr.contains(&entry) {
                self.cidr.push(entry);
            }
        } else {
            let ip: IpAddr = line.parse().map_err(|_| "invalid address")?;
            self.exact.insert(canonical_addr(ip));
        }
        Ok(())
    }

    /// Load entries from a list file. Blank lines and `#` comments are
    /// skipped; malformed lines are logged and skipped. Returns the
    /// number of entries accepted.
    pub fn load_file(&mut self, path: &Path) -> io::Result<usize> {
        let text = fs::read_to_string(path)?;
        self.source = Some(path.to_owned());

        let mut count = 0;
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.insert_line(line) {
                Ok(()) => count += 1,
                Err(reason) => {
                    warn!(
                        "invalid ACL entry at {}:{}: {line} ({reason})",
                        path.display(),
                        line_no + 1
                    );
                }
            }
        }

        info!(
            "loaded {count} ACL entries from {} ({} exact, {} CIDR)",
            path.display(),
            self.exact.len(),
            self.cidr.len()
        );
        Ok(count)
    }

    /// Exact match first, then the CIDR scan.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let addr = canonical_addr(ip);
        if self.exact.contains(&addr) {
            return true;
        }
        self.cidr
            .iter()
            .any(|entry| cidr_match(&addr, &entry.addr, entry.prefix_len))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.cidr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.cidr.len()
    }

    /// Re-encode the loaded set in canonicalised IPv4-mapped form, one
    /// entry per line. Exact entries sort before CIDR entries; within
    /// each group the order is the address order.
    pub fn to_canonical_lines(&self) -> String {
        let mut exact: Vec<&[u8; 16]> = self.exact.iter().collect();
        exact.sort();

        let mut out = String::new();
        for addr in exact {
            let _ = writeln!(out, "{}", Ipv6Addr::from(*addr));
        }
        let mut cidr = self.cidr.clone();
        cidr.sort_by(|a, b| a.addr.cmp(&b.addr).then(a.prefix_len.cmp(&b.prefix_len)));
        for entry in cidr {
            let _ = writeln!(out, "{}/{}", Ipv6Addr::from(entry.addr), entry.prefix_len);
        }
        out
    }
}

/// Block and allow lists checked on every accept. Block wins.
#[derive(Default)]
pub struct AclContext {
    pub blocklist: IpAcl,
    pub allowlist: IpAcl,
}

impl AclContext {
    pub fn check(&self, ip: IpAddr) -> AclDecision {
        if self.blocklist.contains(ip) {
            AclDecision::Block
        } else if self.allowlist.contains(ip) {
            AclDecision::Allow
        } else {
            AclDecision::Neutral
        }
    }
}
