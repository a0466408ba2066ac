//! `resolv.conf` handling.
//!
//! Containers get a copy of the host's resolver configuration with
//! nameservers they cannot reach removed: loopback addresses always, IPv6
//! addresses unless IPv6 is enabled. If nothing is left, public defaults
//! are used instead.
//!
//! Next to each generated file the engine keeps `resolv.conf.hash`. A file
//! whose current hash still matches was not edited by the user, which is
//! what allows a host-side DNS change to be pushed into it later.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Nameservers used when filtering leaves none.
pub const DEFAULT_IPV4_DNS: &[&str] = &["8.8.8.8", "8.8.4.4"];
pub const DEFAULT_IPV6_DNS: &[&str] = &["2001:4860:4860::8888", "2001:4860:4860::8844"];

/// Reads a resolv.conf, treating a missing file as empty.
pub fn get(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Hash stored in `resolv.conf.hash`.
pub fn hash(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

fn nameserver_of(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some("nameserver"), Some(addr)) => Some(addr),
        _ => None,
    }
}

/// Nameservers listed in `content`.
pub fn nameservers(content: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(content)
        .lines()
        .filter_map(nameserver_of)
        .map(str::to_string)
        .collect()
}

/// Search domains of the last `search` line in `content`.
pub fn search_domains(content: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(content)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next() == Some("search")).then(|| fields.map(str::to_string).collect())
        })
        .next_back()
        .unwrap_or_default()
}

/// Removes nameservers a container cannot use.
///
/// Returns the filtered content and whether anything changed.
pub fn filter(content: &[u8], ipv6_enabled: bool) -> (Vec<u8>, bool) {
    let text = String::from_utf8_lossy(content);
    let mut modified = false;
    let mut kept: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(addr) = nameserver_of(line) {
            let drop = match addr.parse::<IpAddr>() {
                Ok(ip) => ip.is_loopback() || (ip.is_ipv6() && !ipv6_enabled),
                Err(_) => false,
            };
            if drop {
                modified = true;
                continue;
            }
        }
        kept.push(line);
    }

    let mut out = kept.join("\n");
    if !kept.is_empty() {
        out.push('\n');
    }
    if nameservers(out.as_bytes()).is_empty() {
        let defaults = DEFAULT_IPV4_DNS
            .iter()
            .chain(ipv6_enabled.then_some(DEFAULT_IPV6_DNS).unwrap_or_default());
        for ns in defaults {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        modified = true;
    }
    (out.into_bytes(), modified)
}

/// Renders a resolv.conf from explicit nameservers and search domains.
///
/// A single search domain of `.` clears the search list.
pub fn build(dns: &[String], dns_search: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for ns in dns {
        out.push_str(&format!("nameserver {}\n", ns));
    }
    if !dns_search.is_empty() && dns_search != ["."] {
        out.push_str(&format!("search {}\n", dns_search.join(" ")));
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_local_and_ipv6() {
        let host = b"search example.com\nnameserver 127.0.0.53\nnameserver 10.0.0.2\nnameserver fe80::1\n";
        let (out, modified) = filter(host, false);
        assert!(modified);
        assert_eq!(nameservers(&out), vec!["10.0.0.2"]);
        assert_eq!(search_domains(&out), vec!["example.com"]);

        let (out, _) = filter(host, true);
        assert_eq!(nameservers(&out), vec!["10.0.0.2", "fe80::1"]);
    }

    #[test]
    fn test_filter_unchanged() {
        let host = b"nameserver 10.0.0.2\n";
        let (out, modified) = filter(host, false);
        assert!(!modified);
        assert_eq!(out, host.to_vec());
    }

    #[test]
    fn test_filter_falls_back_to_defaults() {
        let (out, modified) = filter(b"nameserver 127.0.0.1\n", false);
        assert!(modified);
        assert_eq!(nameservers(&out), vec!["8.8.8.8", "8.8.4.4"]);

        let (out, _) = filter(b"", true);
        assert_eq!(nameservers(&out).len(), 4);
    }

    #[test]
    fn test_build() {
        let out = build(&["1.1.1.1".to_string()], &["a.com".to_string(), "b.com".to_string()]);
        assert_eq!(out, b"nameserver 1.1.1.1\nsearch a.com b.com\n".to_vec());
        assert_eq!(build(&[], &[".".to_string()]), Vec::<u8>::new());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash(b"x"), hash(b"x"));
        assert_ne!(hash(b"x"), hash(b"y"));
        assert!(hash(b"").starts_with("sha256:"));
    }
}
