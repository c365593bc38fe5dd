//! Reference discovery.
//!
//! The first thing a server sends on a fresh connection is its ref
//! advertisement:
//!
//! ```text
//! advertised-refs  =  (no-refs / list-of-refs) flush-pkt
//! no-refs          =  PKT-LINE(zero-id SP "capabilities^{}" NUL capability-list LF)
//! first-ref        =  PKT-LINE(obj-id SP refname NUL capability-list LF)
//! other-ref        =  PKT-LINE(obj-id SP refname LF)
//! other-peeled     =  PKT-LINE(obj-id SP refname "^{}" LF)
//! ```

use crate::capabilities::{CapabilitySet, SYMREF};
use crate::pktline::PktLine;
use crate::{GitError, Result};
use gitwire_objects::ObjectId;
use std::collections::BTreeMap;

const HEADS_PREFIX: &str = "refs/heads/";
const TAGS_PREFIX: &str = "refs/tags/";
const PEEL_SUFFIX: &str = "^{}";

/// Name under which HEAD is recorded.
pub const HEAD: &str = "HEAD";

/// Kind of an advertised ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// `refs/heads/*`.
    Branch,
    /// `refs/tags/*`.
    Tag,
    /// The `HEAD` pseudo-ref.
    Head,
}

impl RefKind {
    /// Returns the full ref name for a short name of this kind.
    pub fn full_name(&self, name: &str) -> String {
        match self {
            Self::Branch => format!("{}{}", HEADS_PREFIX, name),
            Self::Tag => format!("{}{}", TAGS_PREFIX, name),
            Self::Head => HEAD.to_string(),
        }
    }
}

/// A ref as advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    /// Object the ref points to.
    pub object_id: ObjectId,
    /// Branch, tag or HEAD.
    pub kind: RefKind,
    /// For annotated tags, the object the tag peels to.
    pub peeled: Option<ObjectId>,
}

/// What a [`RefHandle`] may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAccess {
    /// Obtained from a fetch conversation; may be wanted.
    Fetchable,
    /// Obtained from a push conversation; may be updated or deleted.
    Pushable,
}

/// A discovered ref bound to the kind of conversation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefHandle {
    /// Short ref name (prefix stripped).
    pub name: String,
    /// Object the ref points to.
    pub object_id: ObjectId,
    /// Branch, tag or HEAD.
    pub kind: RefKind,
    /// Allowed use.
    pub access: RefAccess,
}

impl RefHandle {
    /// Returns the full ref name (`refs/heads/main`).
    pub fn full_name(&self) -> String {
        self.kind.full_name(&self.name)
    }

    /// Ensures the handle allows `access`.
    pub fn require(&self, access: RefAccess) -> Result<()> {
        if self.access == access {
            Ok(())
        } else {
            Err(GitError::InvalidHandle(format!(
                "{} is {:?}, not {:?}",
                self.name, self.access, access
            )))
        }
    }
}

/// The outcome of discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Advertised refs keyed by short name.
    pub refs: BTreeMap<String, AdvertisedRef>,
    /// Server capabilities.
    pub capabilities: CapabilitySet,
    /// Branch that HEAD resolves to, if any.
    pub head: Option<String>,
}

impl Discovery {
    /// Looks up a ref by short name.
    pub fn get(&self, name: &str) -> Option<&AdvertisedRef> {
        self.refs.get(name)
    }

    /// Returns HEAD's object id, if advertised.
    pub fn head_id(&self) -> Option<ObjectId> {
        self.refs.get(HEAD).map(|r| r.object_id)
    }

    /// Returns handles for every ref usable with `access`.
    ///
    /// HEAD is not pushable and is skipped for push handles.
    pub fn handles(&self, access: RefAccess) -> Vec<RefHandle> {
        self.refs
            .iter()
            .filter(|(_, r)| access == RefAccess::Fetchable || r.kind != RefKind::Head)
            .map(|(name, r)| RefHandle {
                name: name.clone(),
                object_id: r.object_id,
                kind: r.kind,
                access,
            })
            .collect()
    }
}

/// Which conversation the advertisement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// upload-pack advertisement.
    Fetch,
    /// receive-pack advertisement.
    Push,
}

/// Incremental parser for a ref advertisement.
///
/// Fed one pkt-line at a time; returns the [`Discovery`] once the
/// advertisement is complete.
#[derive(Debug)]
pub struct DiscoveryParser {
    mode: DiscoveryMode,
    refs: BTreeMap<String, AdvertisedRef>,
    capabilities: Option<CapabilitySet>,
    head_id: Option<ObjectId>,
}

impl DiscoveryParser {
    /// Creates a parser for the given conversation kind.
    pub fn new(mode: DiscoveryMode) -> Self {
        Self {
            mode,
            refs: BTreeMap::new(),
            capabilities: None,
            head_id: None,
        }
    }

    /// Consumes one pkt-line. Returns the discovery once complete.
    pub fn push_line(&mut self, pkt: PktLine) -> Result<Option<Discovery>> {
        let data = match pkt {
            PktLine::Flush => return Ok(Some(self.finish())),
            PktLine::Data(data) => data,
        };

        if let Some(message) = data.strip_prefix(b"ERR ") {
            return Err(GitError::Remote(
                String::from_utf8_lossy(message).trim_end().to_string(),
            ));
        }
        if data.trim_ascii_end() == b"version 1" {
            return Ok(None);
        }
        if data.len() < ObjectId::HEX_LEN {
            return Err(GitError::Protocol(format!(
                "advertisement line too short ({} bytes)",
                data.len()
            )));
        }

        let object_id = ObjectId::from_hex_bytes(&data[..ObjectId::HEX_LEN])
            .map_err(|e| GitError::Protocol(format!("bad advertised object id: {}", e)))?;
        let rest = &data[ObjectId::HEX_LEN..];

        let name = if self.capabilities.is_none() {
            let (name, caps) = match rest.iter().position(|&b| b == 0) {
                Some(nul) => (&rest[..nul], &rest[nul + 1..]),
                None => (rest, &[][..]),
            };
            let capabilities = CapabilitySet::parse(&String::from_utf8_lossy(caps));
            tracing::debug!(capabilities = %capabilities, "server capabilities");
            self.capabilities = Some(capabilities);

            if self.mode == DiscoveryMode::Push && object_id.is_zero() {
                tracing::debug!("empty repository advertised");
                return Ok(Some(self.finish()));
            }
            name
        } else {
            rest
        };

        let name = String::from_utf8_lossy(name);
        self.record(object_id, name.trim());
        Ok(None)
    }

    fn record(&mut self, object_id: ObjectId, name: &str) {
        let (kind, short) = if let Some(short) = name.strip_prefix(HEADS_PREFIX) {
            (RefKind::Branch, short)
        } else if let Some(short) = name.strip_prefix(TAGS_PREFIX) {
            (RefKind::Tag, short)
        } else {
            if name.contains(HEAD) {
                self.head_id = Some(object_id);
                self.refs.insert(
                    HEAD.to_string(),
                    AdvertisedRef {
                        object_id,
                        kind: RefKind::Head,
                        peeled: None,
                    },
                );
            } else {
                tracing::trace!(name, "ignoring advertised ref");
            }
            return;
        };

        if let Some(target) = short.strip_suffix(PEEL_SUFFIX) {
            match self.refs.get_mut(target) {
                Some(existing) => existing.peeled = Some(object_id),
                None => tracing::trace!(name, "peel annotation without a ref"),
            }
            return;
        }

        self.refs.insert(
            short.to_string(),
            AdvertisedRef {
                object_id,
                kind,
                peeled: None,
            },
        );
    }

    fn finish(&mut self) -> Discovery {
        let capabilities = self.capabilities.take().unwrap_or_default();
        let refs = std::mem::take(&mut self.refs);
        let head = self
            .head_id
            .and_then(|head_id| resolve_head(&refs, &capabilities, head_id));

        tracing::debug!(refs = refs.len(), head = ?head, "discovery complete");
        Discovery {
            refs,
            capabilities,
            head,
        }
    }
}

/// Resolves HEAD to a branch: the `symref` capability wins, otherwise the
/// first branch (by name) sharing HEAD's object id.
fn resolve_head(
    refs: &BTreeMap<String, AdvertisedRef>,
    capabilities: &CapabilitySet,
    head_id: ObjectId,
) -> Option<String> {
    let symref = capabilities
        .values(SYMREF)
        .filter_map(|value| value.strip_prefix("HEAD:"))
        .filter_map(|target| target.strip_prefix(HEADS_PREFIX))
        .find(|branch| {
            refs.get(*branch)
                .is_some_and(|r| r.kind == RefKind::Branch)
        });
    if let Some(branch) = symref {
        return Some(branch.to_string());
    }

    refs.iter()
        .find(|(_, r)| r.kind == RefKind::Branch && r.object_id == head_id)
        .map(|(name, _)| name.clone())
}
