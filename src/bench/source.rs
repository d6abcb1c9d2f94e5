use std::{fs, path::PathBuf};

use tracing::{debug, warn};

use super::{error::Error, record::EndpointRecord};

/// Supplies the fixed set of endpoints for a run.
pub trait ConfigSource {
    fn list(&self) -> Result<Vec<EndpointRecord>, Error>;
}

/// A directory of WireGuard configs, one endpoint per file.
///
/// The record id is the file name and the address is the `Endpoint` of the
/// first `[Peer]` section that declares one. Files that can't be read or
/// don't name a peer endpoint are skipped with a warning; only a directory
/// that can't be listed fails the whole source.
pub struct WireGuardDir {
    dir: PathBuf,
}

impl WireGuardDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn unavailable(&self, source: std::io::Error) -> Error {
        Error::SourceUnavailable {
            path: self.dir.clone(),
            source,
        }
    }
}

impl ConfigSource for WireGuardDir {
    fn list(&self) -> Result<Vec<EndpointRecord>, Error> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| self.unavailable(e))? {
            let entry = entry.map_err(|e| self.unavailable(e))?;
            match entry.file_type() {
                Ok(t) if t.is_dir() => continue,
                Ok(_) => paths.push(entry.path()),
                Err(e) => warn!("skipping {}: {}", entry.path().display(), e),
            }
        }
        // read_dir order is unspecified; keep dispatch order stable
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let id = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!("skipping {}: {}", id, e);
                    continue;
                }
            };
            match peer_endpoint(&text) {
                Some(address) => {
                    debug!("{} -> {}", id, address);
                    records.push(EndpointRecord { id, address });
                }
                None => warn!("skipping {}: no [Peer] endpoint", id),
            }
        }
        debug!(
            "found {} endpoint configs in {}",
            records.len(),
            self.dir.display()
        );
        Ok(records)
    }
}

/// A fixed in-memory list of records.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(pub Vec<EndpointRecord>);

impl ConfigSource for StaticSource {
    fn list(&self) -> Result<Vec<EndpointRecord>, Error> {
        Ok(self.0.clone())
    }
}

/// Pulls the first peer `Endpoint` out of a WireGuard config.
pub(crate) fn peer_endpoint(config: &str) -> Option<String> {
    let mut in_peer = false;
    for line in config.lines() {
        let line = match line.find(['#', ';']) {
            Some(idx) => &line[..idx],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let section = line.strip_prefix('[').and_then(|l| l.strip_suffix(']'));
        if let Some(section) = section {
            in_peer = section.trim().eq_ignore_ascii_case("peer");
            continue;
        }
        if !in_peer {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let is_endpoint = key.trim().eq_ignore_ascii_case("endpoint");
            if is_endpoint && !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
[Interface]
PrivateKey = aGVsbG8gd29ybGQgdGhpcyBpcyBub3QgYSByZWFsIGtleQ==
Address = 10.2.0.2/32
DNS = 10.2.0.1

# exit node in Zurich
[Peer]
PublicKey = c29tZSBwdWJsaWMga2V5IHRoYXQgaXMgYWxzbyBmYWtlIQ==
AllowedIPs = 0.0.0.0/0
Endpoint = 185.159.157.20:51820 # primary
";

    #[test]
    fn reads_first_peer_endpoint() {
        assert_eq!(
            peer_endpoint(CONFIG).as_deref(),
            Some("185.159.157.20:51820")
        );
    }

    #[test]
    fn semicolon_starts_a_comment() {
        let config = "[Peer]\n\
                      ; Endpoint = 8.8.8.8:1\n\
                      Endpoint = 4.4.4.4:51820 ; backup\n";
        assert_eq!(peer_endpoint(config).as_deref(), Some("4.4.4.4:51820"));
    }

    #[test]
    fn endpoint_outside_peer_section_is_ignored() {
        let config =
            "[Interface]\nEndpoint = 1.1.1.1:1\n[Peer]\nPublicKey = x\n";
        assert_eq!(peer_endpoint(config), None);
    }

    #[test]
    fn later_peer_is_used_when_first_has_no_endpoint() {
        let config = "\
[Peer]
PublicKey = first
[peer]
endpoint=[2001:db8::1]:51820
[Peer]
Endpoint = 9.9.9.9:51820
";
        assert_eq!(
            peer_endpoint(config).as_deref(),
            Some("[2001:db8::1]:51820")
        );
    }

    #[test]
    fn lists_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, text: &str| {
            fs::write(dir.path().join(name), text).unwrap()
        };
        write("se-3.conf", "[Peer]\nEndpoint = 3.3.3.3:51820\n");
        write("ch-1.conf", CONFIG);
        write("broken.conf", "[Interface]\nAddress = x\n");
        fs::create_dir(dir.path().join("archive")).unwrap();

        let records = WireGuardDir::new(dir.path()).list().unwrap();
        assert_eq!(
            records,
            vec![
                EndpointRecord::new("ch-1.conf", "185.159.157.20:51820"),
                EndpointRecord::new("se-3.conf", "3.3.3.3:51820"),
            ]
        );
    }

    #[test]
    fn missing_directory_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        match WireGuardDir::new(&missing).list() {
            Err(Error::SourceUnavailable { path, .. }) => {
                assert_eq!(path, missing)
            }
            other => panic!("expected SourceUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn static_source_hands_back_its_records() {
        let records = vec![EndpointRecord::new("a", "1.2.3.4:1")];
        assert_eq!(StaticSource(records.clone()).list().unwrap(), records);
    }
}
