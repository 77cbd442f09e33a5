//! Hosts file loading.
//!
//! The whole file is read once, parsed into a (record kind, lowercased
//! name) → address table, and cached for the process lifetime until a
//! caller asks for a reload. A missing or unreadable file is an empty
//! table, not an error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use nimbus_dns_domain::hostname::{classify, NameKind};
use nimbus_dns_domain::{AnswerRecord, RecordType};

#[cfg(windows)]
pub fn default_hosts_path() -> PathBuf {
    PathBuf::from(r"C:\Windows\system32\drivers\etc\hosts")
}

#[cfg(not(windows))]
pub fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

#[derive(Debug, Default)]
pub struct HostsTable {
    map: HashMap<(RecordType, String), IpAddr>,
}

impl HostsTable {
    /// Reads and parses `path`. Missing or unreadable files yield an empty
    /// table.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let table = Self::parse(&content);
                debug!(path = %path.display(), entries = table.len(), "hosts file loaded");
                table
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hosts file unreadable, using empty table");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut map = HashMap::new();
        for line in content.lines() {
            // Everything from the first '#' on is comment.
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(addr_text) = fields.next() else {
                continue;
            };
            let Ok(addr) = addr_text.parse::<IpAddr>() else {
                continue;
            };
            let record_type = match addr {
                IpAddr::V4(_) => RecordType::A,
                IpAddr::V6(_) => RecordType::AAAA,
            };
            for name in fields {
                if classify(name) != NameKind::Hostname {
                    continue;
                }
                // Later lines override earlier ones.
                map.insert((record_type, name.to_ascii_lowercase()), addr);
            }
        }
        Self { map }
    }

    /// Looks up a lowercased name. `localhost` is always resolvable,
    /// independent of file contents.
    pub fn lookup(&self, record_type: RecordType, name: &str) -> Option<AnswerRecord> {
        if name == "localhost" {
            let data = match record_type {
                RecordType::A => "127.0.0.1",
                RecordType::AAAA => "::1",
                _ => return None,
            };
            return Some(AnswerRecord::permanent(data, record_type));
        }
        self.map
            .get(&(record_type, name.to_string()))
            .map(|addr| AnswerRecord::permanent(addr.to_string(), record_type))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# static table
127.0.0.1   localhost
::1         localhost ip6-localhost
10.0.0.1    gateway.lan router.lan   # inline comment
10.0.0.2    gateway.lan
fe80::1     printer.lan
bogus-addr  ignored.lan
10.0.0.3    bad_name.lan
";

    #[test]
    fn test_parse_basic_table() {
        let table = HostsTable::parse(SAMPLE);
        let rec = table.lookup(RecordType::A, "router.lan").unwrap();
        assert_eq!(rec.data, "10.0.0.1");
        assert_eq!(rec.record_type, RecordType::A);
        assert!(rec.is_permanent());

        let v6 = table.lookup(RecordType::AAAA, "printer.lan").unwrap();
        assert_eq!(v6.data, "fe80::1");
    }

    #[test]
    fn test_later_lines_override() {
        let table = HostsTable::parse(SAMPLE);
        assert_eq!(table.lookup(RecordType::A, "gateway.lan").unwrap().data, "10.0.0.2");
    }

    #[test]
    fn test_invalid_fields_skipped() {
        let table = HostsTable::parse(SAMPLE);
        assert!(table.lookup(RecordType::A, "ignored.lan").is_none());
        assert!(table.lookup(RecordType::A, "bad_name.lan").is_none());
    }

    #[test]
    fn test_localhost_synthetic() {
        let table = HostsTable::parse("");
        assert_eq!(table.lookup(RecordType::A, "localhost").unwrap().data, "127.0.0.1");
        assert_eq!(table.lookup(RecordType::AAAA, "localhost").unwrap().data, "::1");
        assert!(table.lookup(RecordType::CNAME, "localhost").is_none());
    }

    #[test]
    fn test_names_lowercased() {
        let table = HostsTable::parse("10.1.1.1 MixedCase.LAN\n");
        assert_eq!(table.lookup(RecordType::A, "mixedcase.lan").unwrap().data, "10.1.1.1");
        // Lookups take the already-normalized name.
        assert!(table.lookup(RecordType::A, "MixedCase.LAN").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let table = HostsTable::load(Path::new("/nonexistent/hosts-file")).await;
        assert!(table.is_empty());
        // localhost still resolves.
        assert!(table.lookup(RecordType::A, "localhost").is_some());
    }
}
