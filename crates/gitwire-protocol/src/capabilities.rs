//! Capability sets and capability selection.
//!
//! The server lists its capabilities once, after a NUL byte on the first
//! advertisement line. The client answers with the subset it wants, sent
//! as a suffix on its first `want` or ref-update line.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Side-band with 1000-byte frames.
pub const SIDE_BAND: &str = "side-band";
/// Side-band with 65520-byte frames.
pub const SIDE_BAND_64K: &str = "side-band-64k";
/// Offset deltas in packs.
pub const OFS_DELTA: &str = "ofs-delta";
/// Shallow (depth-limited) fetches.
pub const SHALLOW: &str = "shallow";
/// Send annotated tags pointing into the fetched history.
pub const INCLUDE_TAG: &str = "include-tag";
/// Per-ref status report after a push.
pub const REPORT_STATUS: &str = "report-status";
/// Ref deletion on push.
pub const DELETE_REFS: &str = "delete-refs";
/// Implementation identifier.
pub const AGENT: &str = "agent";
/// Symbolic ref advertisement (`symref=HEAD:refs/heads/main`).
pub const SYMREF: &str = "symref";

/// An ordered set of capability tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    tokens: Vec<String>,
}

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space-separated capability list.
    pub fn parse(list: &str) -> Self {
        list.split_whitespace().map(str::to_string).collect()
    }

    /// Returns true if `name` is present, either bare or as `name=value`.
    pub fn contains(&self, name: &str) -> bool {
        self.tokens.iter().any(|token| token_name(token) == name)
    }

    /// Returns the value of the first `name=value` token.
    pub fn value<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.tokens.iter().find_map(|token| {
            token
                .split_once('=')
                .filter(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }

    /// Returns the values of every `name=value` token, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tokens.iter().filter_map(move |token| {
            token
                .split_once('=')
                .filter(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }

    /// Iterates the raw tokens in advertisement order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no capability was advertised.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns the negotiated side-band mode.
    pub fn side_band(&self) -> SideBandMode {
        if self.contains(SIDE_BAND_64K) {
            SideBandMode::SideBand64k
        } else if self.contains(SIDE_BAND) {
            SideBandMode::SideBand
        } else {
            SideBandMode::None
        }
    }
}

fn token_name(token: &str) -> &str {
    token.split_once('=').map_or(token, |(key, _)| key)
}

impl FromIterator<String> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for token in iter {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        Self { tokens }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Side-band multiplexing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBandMode {
    /// Pack data is sent raw.
    None,
    /// `side-band`: frames of at most 1000 bytes.
    SideBand,
    /// `side-band-64k`: frames of at most 65520 bytes.
    SideBand64k,
}

impl SideBandMode {
    /// Returns true when pack data is multiplexed.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Largest frame payload (channel byte included).
    pub fn max_payload(&self) -> usize {
        match self {
            Self::None => 0,
            Self::SideBand => 1000 - 4,
            Self::SideBand64k => crate::pktline::MAX_PKT_DATA_LEN,
        }
    }
}

/// Local capability preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPreferences {
    /// Request side-band multiplexing when offered.
    pub side_band: bool,
    /// Ask for offset deltas when fetching. Off by default since
    /// `PackfileCodec` cannot resolve deltas.
    pub ofs_delta: bool,
    /// Request annotated tags when offered.
    pub include_tag: bool,
    /// Agent string sent back when the server advertises `agent`.
    pub agent: Option<String>,
}

impl Default for CapabilityPreferences {
    fn default() -> Self {
        Self {
            side_band: true,
            ofs_delta: false,
            include_tag: true,
            agent: Some(format!("gitwire/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

fn push_agent(selected: &mut Vec<String>, server: &CapabilitySet, prefs: &CapabilityPreferences) {
    if let Some(agent) = &prefs.agent {
        if server.contains(AGENT) {
            selected.push(format!("{}={}", AGENT, agent));
        }
    }
}

/// Computes the capability string for the first `want` line.
pub fn select_fetch_capabilities(
    server: &CapabilitySet,
    prefs: &CapabilityPreferences,
    depth: Option<u32>,
) -> String {
    let mut selected = Vec::new();

    if prefs.side_band {
        if server.contains(SIDE_BAND_64K) {
            selected.push(SIDE_BAND_64K.to_string());
        } else if server.contains(SIDE_BAND) {
            selected.push(SIDE_BAND.to_string());
        }
    }
    if prefs.ofs_delta && server.contains(OFS_DELTA) {
        selected.push(OFS_DELTA.to_string());
    }
    if depth.is_some() && server.contains(SHALLOW) {
        selected.push(SHALLOW.to_string());
    }
    if prefs.include_tag && server.contains(INCLUDE_TAG) {
        selected.push(INCLUDE_TAG.to_string());
    }
    push_agent(&mut selected, server, prefs);

    selected.join(" ")
}

/// Computes the capability string for the first ref-update command.
pub fn select_push_capabilities(server: &CapabilitySet, prefs: &CapabilityPreferences) -> String {
    let mut selected = Vec::new();

    for name in [REPORT_STATUS, DELETE_REFS, OFS_DELTA] {
        if server.contains(name) {
            selected.push(name.to_string());
        }
    }
    push_agent(&mut selected, server, prefs);

    selected.join(" ")
}
