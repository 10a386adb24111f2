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

//! Workarounds for known-broken server implementations.
//!
//! The server's identification line is parsed once, before the first
//! key exchange, and matched against a table of [`CompatRule`]s. The
//! resulting [`Quirks`] adjust the algorithm lists the client offers.
//!
//! ```
//! use sshlink::compat::{ServerVersion, Quirks, DEFAULT_RULES, quirks_for};
//!
//! let v = ServerVersion::parse("SSH-2.0-OpenSSH_6.6p1 Ubuntu-2ubuntu1").unwrap();
//! assert!(quirks_for(&v, DEFAULT_RULES).contains(Quirks::NO_CURVE25519));
//! ```
use std::borrow::Cow;

use bitflags::bitflags;
use log::debug;

use crate::{kex, Error, Preferred};

bitflags! {
    /// Behaviour adjustments for a given server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// Curve25519 key exchange is broken: never offer it.
        const NO_CURVE25519 = 1;
        /// Delayed compression is not supported.
        const NO_DELAYED_COMPRESSION = 1 << 1;
    }
}

/// A parsed `SSH-protoversion-softwareversion SP comments` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub protocol: String,
    pub software: String,
    pub comments: Option<String>,
}

impl ServerVersion {
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        let rest = line.strip_prefix("SSH-").ok_or(Error::Version)?;
        let (protocol, rest) = rest.split_once('-').ok_or(Error::Version)?;
        if protocol != "2.0" && protocol != "1.99" {
            return Err(Error::Version);
        }
        let (software, comments) = match rest.split_once(' ') {
            Some((s, c)) => (s, Some(c.to_string())),
            None => (rest, None),
        };
        if software.is_empty() {
            return Err(Error::Version);
        }
        Ok(ServerVersion {
            protocol: protocol.to_string(),
            software: software.to_string(),
            comments,
        })
    }

    /// Split the software version into product and numeric version,
    /// e.g. `OpenSSH_6.6p1` into `("OpenSSH", "6.6")`. The numeric
    /// version stops at the first character that is neither a digit nor
    /// a dot.
    pub fn product_version(&self) -> (&str, &str) {
        let (product, version) = match self.software.split_once('_') {
            Some(x) => x,
            None => return (&self.software, ""),
        };
        let end = version
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(version.len());
        #[allow(clippy::indexing_slicing)] // end <= len
        (product, version[..end].trim_end_matches('.'))
    }
}

/// Quirks applied to servers of a given product, for an exact set of
/// numeric versions. `"6.6"` matches `OpenSSH_6.6` and `OpenSSH_6.6p1`,
/// but not `OpenSSH_6.6.1`.
#[derive(Debug, Clone)]
pub struct CompatRule {
    pub product: Cow<'static, str>,
    pub versions: Cow<'static, [&'static str]>,
    pub quirks: Quirks,
}

impl CompatRule {
    pub fn matches(&self, version: &ServerVersion) -> bool {
        let (product, numeric) = version.product_version();
        product == self.product && self.versions.iter().any(|v| *v == numeric)
    }
}

/// Servers whose curve25519 implementation produces bad shared secrets
/// about one time in 256.
pub const DEFAULT_RULES: &[CompatRule] = &[CompatRule {
    product: Cow::Borrowed("OpenSSH"),
    versions: Cow::Borrowed(&["6.5", "6.6"]),
    quirks: Quirks::NO_CURVE25519,
}];

/// Union of the quirks of every rule matching `version`.
pub fn quirks_for(version: &ServerVersion, rules: &[CompatRule]) -> Quirks {
    rules
        .iter()
        .filter(|r| r.matches(version))
        .fold(Quirks::empty(), |q, r| q | r.quirks)
}

/// Apply `quirks` to a copy of the preferred algorithm lists.
pub(crate) fn apply(quirks: Quirks, preferred: &Preferred) -> Preferred {
    let mut p = preferred.clone();
    if quirks.contains(Quirks::NO_CURVE25519) {
        debug!("server has a broken curve25519, not offering it");
        p.kex = Cow::Owned(
            p.kex
                .iter()
                .filter(|k| **k != kex::CURVE25519 && **k != kex::CURVE25519_PRE_RFC_8731)
                .cloned()
                .collect(),
        );
    }
    #[cfg(feature = "flate2")]
    if quirks.contains(Quirks::NO_DELAYED_COMPRESSION) {
        p.compression = Cow::Owned(
            p.compression
                .iter()
                .filter(|c| **c != crate::compression::ZLIB_LEGACY)
                .cloned()
                .collect(),
        );
    }
    p
}
