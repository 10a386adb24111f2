// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! OpenSSH `known_hosts` files.
//!
//! Each line holds an optional marker (`@revoked` or `@cert-authority`),
//! a comma-separated list of host patterns, and a public key. Patterns
//! are plain names, `[host]:port` for non-standard ports, wildcards
//! (`*` and `?`), negations (`!pattern`) or salted hashes
//! (`|1|salt|hash`, HMAC-SHA1 of the name keyed by the salt).
//!
//! A `@revoked` entry matching both the host and the key rejects the key,
//! whatever other entries say.
use std::borrow::Cow;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use data_encoding::{BASE64, BASE64_MIME};
use globset::GlobBuilder;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use rand::RngCore;
use sha1::Sha1;
use ssh_key::PublicKey;

use super::{parse_public_key_base64, public_key_base64, HostKeyVerifier};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Revoked,
    CertAuthority,
}

#[derive(Debug, Clone)]
pub struct KnownHostEntry {
    /// 1-based line number in the file.
    pub line: usize,
    pub marker: Option<Marker>,
    pub hosts: String,
    pub key: PublicKey,
}

impl KnownHostEntry {
    pub fn matches_host(&self, host: &str, port: u16) -> bool {
        match_hostname(&host_port(host, port), &self.hosts)
    }
}

/// The contents of a known hosts file.
#[derive(Debug, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
    path: Option<PathBuf>,
}

/// `~/.ssh/known_hosts`
pub fn default_path() -> Result<PathBuf, Error> {
    home::home_dir()
        .map(|home_dir| home_dir.join(".ssh").join("known_hosts"))
        .ok_or(Error::NoHomeDir)
}

fn host_port(host: &str, port: u16) -> Cow<'_, str> {
    if port == 22 {
        Cow::Borrowed(host)
    } else {
        Cow::Owned(format!("[{host}]:{port}"))
    }
}

impl KnownHosts {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let mut first = fields.next();
            let marker = match first {
                Some("@revoked") => Some(Marker::Revoked),
                Some("@cert-authority") => Some(Marker::CertAuthority),
                Some(m) if m.starts_with('@') => {
                    debug!("unknown marker {m:?} on line {line_no}");
                    continue;
                }
                _ => None,
            };
            if marker.is_some() {
                first = fields.next();
            }
            let (Some(hosts), Some(_algorithm), Some(key)) = (first, fields.next(), fields.next())
            else {
                return Err(Error::KnownHostsFormat { line: line_no });
            };
            let key = parse_public_key_base64(key)
                .map_err(|_| Error::KnownHostsFormat { line: line_no })?;
            entries.push(KnownHostEntry {
                line: line_no,
                marker,
                hosts: hosts.to_string(),
                key,
            });
        }
        Ok(KnownHosts {
            entries,
            path: None,
        })
    }

    /// Load `path`. A missing file is an empty store; new entries will
    /// be written there by [`KnownHosts::learn`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut known = match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        known.path = Some(path.to_path_buf());
        Ok(known)
    }

    pub fn load_default() -> Result<Self, Error> {
        Self::load(default_path()?)
    }

    pub fn entries(&self) -> &[KnownHostEntry] {
        &self.entries
    }

    /// Whether `key` is trusted for `host:port`.
    ///
    /// Returns `Ok(false)` if the host is unknown,
    /// [`Error::KeyChanged`] if another key of the same algorithm is
    /// recorded for it and [`Error::RevokedKey`] if a matching entry
    /// revokes this key.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, Error> {
        let host_port = host_port(host, port);
        let mut trusted = false;
        let mut changed = None;
        for entry in &self.entries {
            if !match_hostname(&host_port, &entry.hosts) {
                continue;
            }
            match entry.marker {
                Some(Marker::Revoked) => {
                    if entry.key.key_data() == key.key_data() {
                        return Err(Error::RevokedKey { line: entry.line });
                    }
                }
                // Host certificates are not supported, CA keys never
                // match a plain host key.
                Some(Marker::CertAuthority) => {}
                None => {
                    if entry.key.key_data() == key.key_data() {
                        trusted = true
                    } else if entry.key.algorithm() == key.algorithm() && changed.is_none() {
                        changed = Some(entry.line)
                    }
                }
            }
        }
        if trusted {
            return Ok(true);
        }
        match changed {
            Some(line) => Err(Error::KeyChanged { line }),
            None => Ok(false),
        }
    }

    /// Record `key` for `host:port`, appending it to the backing file if
    /// there is one. With `hash`, the host name is stored hashed.
    pub fn learn(&mut self, host: &str, port: u16, key: &PublicKey, hash: bool) -> Result<(), Error> {
        let host_port = host_port(host, port);
        let hosts = if hash {
            let mut salt = [0; 20];
            rand::thread_rng().fill_bytes(&mut salt);
            hash_hostname(&host_port, &salt)
        } else {
            host_port.into_owned()
        };
        let line = format!("{hosts} {} {}", key.algorithm(), public_key_base64(key)?);
        let line_no = match self.path {
            Some(ref path) => append_line(path, &line)?,
            None => self.entries.last().map(|e| e.line + 1).unwrap_or(1),
        };
        self.entries.push(KnownHostEntry {
            line: line_no,
            marker: None,
            hosts,
            key: key.clone(),
        });
        Ok(())
    }
}

/// Append `line` to `path`, returning its line number.
fn append_line(path: &Path, line: &str) -> Result<usize, Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let mut existing = String::new();
    file.read_to_string(&mut existing)?;
    let ends_in_newline = existing.is_empty() || existing.ends_with('\n');

    file.seek(SeekFrom::End(0))?;
    let mut file = std::io::BufWriter::new(file);
    if !ends_in_newline {
        file.write_all(b"\n")?;
    }
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(existing.lines().count() + 1)
}

/// `|1|base64(salt)|base64(HMAC-SHA1(salt, host))`
pub fn hash_hostname(host: &str, salt: &[u8]) -> String {
    let hash = match Hmac::<Sha1>::new_from_slice(salt) {
        Ok(hmac) => hmac.chain_update(host).finalize().into_bytes().to_vec(),
        // HMAC accepts keys of any length.
        Err(_) => Vec::new(),
    };
    format!("|1|{}|{}", BASE64.encode(salt), BASE64.encode(&hash))
}

fn match_hashed(host: &str, entry: &str) -> bool {
    let mut parts = entry.split('|').skip(2);
    let Some(Ok(salt)) = parts.next().map(|p| BASE64_MIME.decode(p.as_bytes())) else {
        return false;
    };
    let Some(Ok(hash)) = parts.next().map(|p| BASE64_MIME.decode(p.as_bytes())) else {
        return false;
    };
    match Hmac::<Sha1>::new_from_slice(&salt) {
        Ok(hmac) => hmac.chain_update(host).verify_slice(&hash).is_ok(),
        Err(_) => false,
    }
}

fn match_pattern(host: &str, pattern: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return host.eq_ignore_ascii_case(pattern);
    }
    // Only `*` and `?` are wildcards, everything else is literal.
    let mut glob = String::with_capacity(pattern.len());
    for piece in pattern.split_inclusive(['*', '?']) {
        match piece.strip_suffix(['*', '?']) {
            Some(literal) => {
                glob.push_str(&globset::escape(literal));
                glob.push_str(piece.get(literal.len()..).unwrap_or_default());
            }
            None => glob.push_str(&globset::escape(piece)),
        }
    }
    match GlobBuilder::new(&glob).case_insensitive(true).build() {
        Ok(g) => g.compile_matcher().is_match(host),
        Err(e) => {
            warn!("invalid host pattern {pattern:?}: {e}");
            false
        }
    }
}

/// Whether `host` (already in `[host]:port` form when needed) matches
/// the comma-separated `patterns`. A matching negated pattern excludes
/// the host from the whole line.
fn match_hostname(host: &str, patterns: &str) -> bool {
    let mut matched = false;
    for entry in patterns.split(',') {
        if entry.starts_with("|1|") {
            matched |= match_hashed(host, entry);
        } else if let Some(negated) = entry.strip_prefix('!') {
            if match_pattern(host, negated) {
                return false;
            }
        } else {
            matched |= match_pattern(host, entry);
        }
    }
    matched
}

/// A [`HostKeyVerifier`] backed by a known hosts file.
#[derive(Debug)]
pub struct KnownHostsVerifier {
    known: Mutex<KnownHosts>,
    accept_new: bool,
    hash_new: bool,
}

impl KnownHostsVerifier {
    pub fn new(known: KnownHosts) -> Self {
        KnownHostsVerifier {
            known: Mutex::new(known),
            accept_new: false,
            hash_new: false,
        }
    }

    /// Trust and record keys of hosts that have no entry yet. Changed
    /// and revoked keys are still rejected.
    pub fn accept_new(mut self, hash: bool) -> Self {
        self.accept_new = true;
        self.hash_new = hash;
        self
    }
}

impl HostKeyVerifier for KnownHostsVerifier {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, Error> {
        let mut known = self.known.lock().map_err(|_| Error::Inconsistent)?;
        if known.check(host, port, key)? {
            return Ok(true);
        }
        if self.accept_new {
            debug!("learning {} key for {host}:{port}", key.algorithm());
            known.learn(host, port, key, self.hash_new)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Checks keys against `~/.ssh/known_hosts`, read at each handshake.
/// Unknown hosts are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKnownHosts;

impl HostKeyVerifier for DefaultKnownHosts {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, Error> {
        KnownHosts::load_default()?.check(host, port, key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LOCALHOST_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";
    const PIJUL_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIA6rWI3G1sz07DnfFlrouTcysQlj2P+jpNSOEWD9OJ3X";
    const OTHER_PIJUL_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIA6rWI3G2sz07DnfFlrouTcysQlj2P+jpNSOEWD9OJ3X";
    const EXAMPLE_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";

    fn key(b64: &str) -> PublicKey {
        parse_public_key_base64(b64).unwrap()
    }

    fn fixture() -> String {
        format!(
            "[localhost]:13265 ssh-ed25519 {LOCALHOST_KEY}\n\
             #pijul.org,37.120.161.53 ssh-ed25519 {OTHER_PIJUL_KEY}\n\
             pijul.org,37.120.161.53 ssh-ed25519 {PIJUL_KEY}\n\
             |1|O33ESRMWPVkMYIwJ1Uw+n877jTo=|nuuC5vEqXlEZ/8BXQR7m619W6Ak= ssh-ed25519 {EXAMPLE_KEY}\n\
             *.example.org,!bad.example.org ssh-ed25519 {PIJUL_KEY}\n"
        )
    }

    #[test]
    fn check_known_hosts() {
        let _ = env_logger::try_init();
        let known = KnownHosts::parse(&fixture()).unwrap();

        // Non-standard port.
        assert!(known.check("localhost", 13265, &key(LOCALHOST_KEY)).unwrap());
        assert!(!known.check("localhost", 22, &key(LOCALHOST_KEY)).unwrap());
        // Hashed.
        assert!(known.check("example.com", 22, &key(EXAMPLE_KEY)).unwrap());
        // Several hosts on a line.
        assert!(known.check("37.120.161.53", 22, &key(PIJUL_KEY)).unwrap());
        // Commented out lines are not trusted, the other key is a change.
        assert!(matches!(
            known.check("pijul.org", 22, &key(OTHER_PIJUL_KEY)),
            Err(Error::KeyChanged { line: 3 })
        ));
        // Unknown host.
        assert!(!known.check("nowhere.net", 22, &key(PIJUL_KEY)).unwrap());
    }

    #[test]
    fn wildcards_and_negation() {
        let known = KnownHosts::parse(&fixture()).unwrap();
        assert!(known.check("www.example.org", 22, &key(PIJUL_KEY)).unwrap());
        assert!(known.check("WWW.Example.ORG", 22, &key(PIJUL_KEY)).unwrap());
        assert!(!known.check("bad.example.org", 22, &key(PIJUL_KEY)).unwrap());
        assert!(!known.check("example.org", 22, &key(PIJUL_KEY)).unwrap());
        assert!(match_pattern("[host1]:2222", "[host?]:2222"));
        assert!(!match_pattern("[host1]:2223", "[host?]:2222"));
    }

    #[test]
    fn revoked_entry_wins_over_trusted_entry() {
        let text = format!(
            "pijul.org ssh-ed25519 {PIJUL_KEY}\n\
             @revoked * ssh-ed25519 {PIJUL_KEY}\n"
        );
        let known = KnownHosts::parse(&text).unwrap();
        assert!(matches!(
            known.check("pijul.org", 22, &key(PIJUL_KEY)),
            Err(Error::RevokedKey { line: 2 })
        ));
        // Other keys are not affected by the revocation.
        assert!(!known.check("other.org", 22, &key(EXAMPLE_KEY)).unwrap());
    }

    #[test]
    fn hashed_and_plain_entries_agree() {
        let hashed = hash_hostname("[git.example.net]:2222", b"0123456789abcdefghij");
        let text = format!(
            "{hashed} ssh-ed25519 {PIJUL_KEY}\n\
             [git.example.net]:2222 ssh-ed25519 {PIJUL_KEY}\n"
        );
        let known = KnownHosts::parse(&text).unwrap();
        for entry in known.entries() {
            assert!(entry.matches_host("git.example.net", 2222));
            assert!(!entry.matches_host("git.example.net", 22));
        }
    }

    #[test]
    fn markers_and_malformed_lines() {
        let text = format!("@cert-authority *.example.org ssh-ed25519 {PIJUL_KEY}\n");
        let known = KnownHosts::parse(&text).unwrap();
        assert_eq!(known.entries()[0].marker, Some(Marker::CertAuthority));
        assert!(!known.check("a.example.org", 22, &key(PIJUL_KEY)).unwrap());

        assert!(matches!(
            KnownHosts::parse("\n\nhost ssh-ed25519\n"),
            Err(Error::KnownHostsFormat { line: 3 })
        ));
        assert!(matches!(
            KnownHosts::parse("host ssh-ed25519 not-base64!\n"),
            Err(Error::KnownHostsFormat { line: 1 })
        ));
    }

    #[test]
    fn learn_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("pijul.org ssh-ed25519 {PIJUL_KEY}")).unwrap();

        let mut known = KnownHosts::load(&path).unwrap();
        known.learn("localhost", 2022, &key(LOCALHOST_KEY), false).unwrap();
        known.learn("example.com", 22, &key(EXAMPLE_KEY), true).unwrap();

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.entries().len(), 3);
        assert!(reloaded.check("localhost", 2022, &key(LOCALHOST_KEY)).unwrap());
        assert!(reloaded.check("example.com", 22, &key(EXAMPLE_KEY)).unwrap());
        assert!(reloaded.entries()[2].hosts.starts_with("|1|"));
        assert_eq!(reloaded.entries()[1].line, 2);
    }

    #[test]
    fn verifier_accepts_new_hosts_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let verifier = KnownHostsVerifier::new(KnownHosts::load(&path).unwrap());
        assert!(!verifier.verify("pijul.org", 22, &key(PIJUL_KEY)).unwrap());

        let verifier = KnownHostsVerifier::new(KnownHosts::load(&path).unwrap()).accept_new(true);
        assert!(verifier.verify("pijul.org", 22, &key(PIJUL_KEY)).unwrap());
        assert!(matches!(
            verifier.verify("pijul.org", 22, &key(OTHER_PIJUL_KEY)),
            Err(Error::KeyChanged { .. })
        ));
    }
}
