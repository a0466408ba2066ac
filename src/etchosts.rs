//! `/etc/hosts` generation for containers.

use crate::error::Result;
use crate::fsutil::write_atomic;
use std::fs;
use std::path::Path;

/// Entries every generated hosts file starts with.
const DEFAULT_CONTENT: &[(&str, &str)] = &[
    ("127.0.0.1", "localhost"),
    ("::1", "localhost ip6-localhost ip6-loopback"),
    ("fe00::0", "ip6-localnet"),
    ("ff00::0", "ip6-mcastprefix"),
    ("ff02::1", "ip6-allnodes"),
    ("ff02::2", "ip6-allrouters"),
];

/// One `address names` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub hosts: String,
    pub ip: String,
}

/// Writes a hosts file for a container.
///
/// With a non-empty `ip` the container's own `hostname[.domainname]` maps
/// to it. `extra` lines (links, user supplied hosts) are appended last.
pub fn build(path: &Path, ip: &str, hostname: &str, domainname: &str, extra: &[Record]) -> Result<()> {
    let mut content = String::new();
    for (addr, names) in DEFAULT_CONTENT {
        content.push_str(&format!("{}\t{}\n", addr, names));
    }
    if !ip.is_empty() {
        if domainname.is_empty() {
            content.push_str(&format!("{}\t{}\n", ip, hostname));
        } else {
            content.push_str(&format!("{}\t{}.{} {}\n", ip, hostname, domainname, hostname));
        }
    }
    for record in extra {
        content.push_str(&format!("{}\t{}\n", record.ip, record.hosts));
    }
    write_atomic(path, content.as_bytes())
}

/// Points every line naming `hostname` at `ip`, adding a line if none does.
pub fn update(path: &Path, ip: &str, hostname: &str) -> Result<()> {
    let old = fs::read_to_string(path)?;
    let mut found = false;
    let mut content = String::with_capacity(old.len() + hostname.len() + ip.len() + 2);

    for line in old.lines() {
        let mut fields = line.split_whitespace();
        let names_match = fields.next().is_some() && fields.any(|name| name == hostname);
        if names_match && !line.trim_start().starts_with('#') {
            found = true;
            let names = line
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim_start())
                .unwrap_or_default();
            content.push_str(&format!("{}\t{}\n", ip, names));
        } else {
            content.push_str(line);
            content.push('\n');
        }
    }
    if !found {
        content.push_str(&format!("{}\t{}\n", ip, hostname));
    }
    write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hosts");
        let extra = [Record {
            hosts: "db".to_string(),
            ip: "172.17.0.3".to_string(),
        }];
        build(&path, "172.17.0.2", "web", "example.com", &extra).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(content.contains("172.17.0.2\tweb.example.com web\n"));
        assert!(content.ends_with("172.17.0.3\tdb\n"));
    }

    #[test]
    fn test_build_without_ip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hosts");
        build(&path, "", "web", "", &[]).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("web"));
    }

    #[test]
    fn test_update_replaces_and_appends() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hosts");
        build(
            &path,
            "172.17.0.2",
            "web",
            "",
            &[Record {
                hosts: "db".to_string(),
                ip: "172.17.0.3".to_string(),
            }],
        )
        .unwrap();

        update(&path, "172.17.0.9", "db").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("172.17.0.9\tdb\n"));
        assert!(!content.contains("172.17.0.3"));

        update(&path, "172.17.0.10", "cache").unwrap();
        assert!(fs::read_to_string(&path).unwrap().ends_with("172.17.0.10\tcache\n"));
    }
}
