//! Git smart-protocol client engine for gitwire.
//!
//! This crate speaks the client side of the git smart transfer protocol:
//! pkt-line framing, ref discovery, capability negotiation and the fetch
//! (upload-pack) and push (receive-pack) conversations. Conversations are
//! sans-io state machines; [`FetchSession`] and [`PushSession`] drive them
//! over tokio streams.

mod capabilities;
mod config;
mod discovery;
mod error;
mod event;
mod fetch;
mod history;
mod pack;
mod pktline;
mod push;
mod session;
mod sideband;
mod transport;

pub use capabilities::{
    select_fetch_capabilities, select_push_capabilities, CapabilityPreferences, CapabilitySet,
    SideBandMode,
};
pub use config::{ConversationConfig, DEFAULT_READ_CHUNK_SIZE};
pub use discovery::{
    AdvertisedRef, Discovery, DiscoveryMode, DiscoveryParser, RefAccess, RefHandle, RefKind, HEAD,
};
pub use error::GitError;
pub use event::{EventReceiver, FetchEvent, PushEvent};
pub use fetch::{FetchConversation, FetchResult, FetchState};
pub use history::{History, PendingCommit, SplicedHistory};
pub use pack::{PackBuilder, PackCodec, PackParser, PackfileCodec, PACK_SIGNATURE};
pub use pktline::{PktLine, PktLineDecoder, PktLineWriter, MAX_PKT_DATA_LEN, MAX_PKT_LEN};
pub use push::{
    CommandStatus, PushConversation, PushReport, PushState, RefStatus, RefUpdateCommand,
    UnpackStatus,
};
pub use session::{Conversation, FetchSession, PushSession, Session};
pub use sideband::{Channel, SideBandDemux, SideBandFrame, SideBandMessage};
pub use transport::{daemon_request, Service, DEFAULT_DAEMON_PORT};

pub use gitwire_objects::{GitObject, ObjectId, ObjectType};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
