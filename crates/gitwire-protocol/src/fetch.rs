//! Fetch conversation (upload-pack client).
//!
//! ```text
//! Discovering ──flush-pkt──▶ Discovered ──flush()──▶ Receiving ──pack end──▶ Fetched
//!                                 │
//!                                 └── flush() with nothing wanted ──▶ Ended
//! ```
//!
//! The conversation never blocks: incoming bytes are pushed in with
//! [`FetchConversation::receive`], caller actions write pkt-lines to the
//! bound writer, and notifications go out on the event channel.

use crate::capabilities::{select_fetch_capabilities, CapabilitySet, SHALLOW};
use crate::config::ConversationConfig;
use crate::discovery::{
    AdvertisedRef, Discovery, DiscoveryMode, DiscoveryParser, RefAccess, RefHandle, RefKind,
};
use crate::event::{self, EventReceiver, EventSink, FetchEvent};
use crate::pack::{PackCodec, PackfileCodec, PACK_SIGNATURE};
use crate::pktline::{PktLine, PktLineDecoder, PktLineWriter};
use crate::sideband::{SideBandDemux, SideBandMessage};
use crate::{GitError, Result};
use bytes::{Bytes, BytesMut};
use gitwire_objects::{GitObject, ObjectId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::Write;

/// States of a fetch conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Reading the ref advertisement.
    Discovering,
    /// Advertisement read; waiting for `want` and `flush` calls.
    Discovered,
    /// Request sent; reading acknowledgements and pack data.
    Receiving,
    /// Pack decoded and result available.
    Fetched,
    /// Finished without a data phase.
    Ended,
    /// A fatal error occurred.
    Failed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "discovering",
            Self::Discovered => "discovered",
            Self::Receiving => "receiving",
            Self::Fetched => "fetched",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Wanted refs whose object arrived in the pack, keyed by short name.
    pub refs: BTreeMap<String, GitObject>,
    /// Every object decoded from the pack.
    pub objects: HashMap<ObjectId, GitObject>,
    /// Shallow boundary commits reported for depth-limited fetches.
    pub shallow: Vec<ObjectId>,
}

#[derive(Debug, Default)]
struct Receive {
    side_band: bool,
    raw_mode: bool,
    demux: SideBandDemux,
    raw: BytesMut,
    shallow: Vec<ObjectId>,
}

impl Receive {
    fn pack_started(&self) -> bool {
        self.raw_mode || self.demux.frames() > 0
    }
}

/// A single fetch over one duplex stream.
pub struct FetchConversation<W> {
    state: FetchState,
    config: ConversationConfig,
    decoder: PktLineDecoder,
    parser: DiscoveryParser,
    discovery: Discovery,
    selected: String,
    negotiated: CapabilitySet,
    capabilities_sent: bool,
    wanted: BTreeSet<ObjectId>,
    writer: PktLineWriter<W>,
    receive: Receive,
    codec: Box<dyn PackCodec>,
    result: Option<FetchResult>,
    events: EventSink<FetchEvent>,
}

impl<W: Write> FetchConversation<W> {
    /// Creates a conversation writing to `writer`, using the default pack codec.
    pub fn new(writer: W, config: ConversationConfig) -> (Self, EventReceiver<FetchEvent>) {
        Self::with_codec(writer, config, PackfileCodec)
    }

    /// Creates a conversation with a custom pack codec.
    pub fn with_codec(
        writer: W,
        config: ConversationConfig,
        codec: impl PackCodec + 'static,
    ) -> (Self, EventReceiver<FetchEvent>) {
        let (events, receiver) = event::channel();
        let conversation = Self {
            state: FetchState::Discovering,
            config,
            decoder: PktLineDecoder::new(),
            parser: DiscoveryParser::new(DiscoveryMode::Fetch),
            discovery: Discovery::default(),
            selected: String::new(),
            negotiated: CapabilitySet::new(),
            capabilities_sent: false,
            wanted: BTreeSet::new(),
            writer: PktLineWriter::new(writer),
            receive: Receive::default(),
            codec: Box::new(codec),
            result: None,
            events,
        };
        (conversation, receiver)
    }

    /// Current state.
    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Returns true once the conversation can make no further progress.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            FetchState::Fetched | FetchState::Ended | FetchState::Failed
        )
    }

    /// Discovered refs (empty until discovery completes).
    pub fn refs(&self) -> &BTreeMap<String, AdvertisedRef> {
        &self.discovery.refs
    }

    /// Full discovery outcome.
    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Capabilities advertised by the server.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.discovery.capabilities
    }

    /// Capability string sent with the first `want`.
    pub fn selected_capabilities(&self) -> &str {
        &self.selected
    }

    /// Branch HEAD resolves to.
    pub fn head(&self) -> Option<&str> {
        self.discovery.head.as_deref()
    }

    /// Fetchable handles for every discovered ref.
    pub fn handles(&self) -> Vec<RefHandle> {
        self.discovery.handles(RefAccess::Fetchable)
    }

    /// Object ids marked as wanted.
    pub fn wanted(&self) -> impl Iterator<Item = &ObjectId> {
        self.wanted.iter()
    }

    /// Result, once fetched.
    pub fn result(&self) -> Option<&FetchResult> {
        self.result.as_ref()
    }

    /// Takes the result out of the conversation.
    pub fn take_result(&mut self) -> Option<FetchResult> {
        self.result.take()
    }

    /// The bound writer.
    pub fn writer(&self) -> &W {
        self.writer.get_ref()
    }

    /// The bound writer, mutably (used to drain buffered output).
    pub fn writer_mut(&mut self) -> &mut W {
        self.writer.get_mut()
    }

    /// Consumes the conversation, returning the writer.
    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }

    /// Feeds bytes received from the transport.
    pub fn receive(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            FetchState::Failed => return Err(self.invalid("receive")),
            FetchState::Fetched | FetchState::Ended => {
                tracing::trace!(len = data.len(), "ignoring bytes after end");
                return Ok(());
            }
            _ => {}
        }
        self.decoder.feed(data);
        let result = self.process();
        self.check(result)
    }

    /// Signals that the transport closed.
    pub fn close(&mut self) -> Result<()> {
        let result = match self.state {
            FetchState::Discovering => Err(GitError::UnexpectedEof(
                "stream closed during discovery".to_string(),
            )),
            FetchState::Discovered if self.decoder.has_partial() => Err(GitError::UnexpectedEof(
                "stream closed mid-frame".to_string(),
            )),
            FetchState::Discovered => {
                tracing::debug!("stream closed after discovery");
                self.end();
                Ok(())
            }
            FetchState::Receiving if self.receive.raw_mode => {
                let rest = self.decoder.take_remaining();
                self.receive.raw.extend_from_slice(&rest);
                self.complete()
            }
            FetchState::Receiving => Err(GitError::UnexpectedEof(
                "stream closed before the pack completed".to_string(),
            )),
            FetchState::Fetched | FetchState::Ended | FetchState::Failed => Ok(()),
        };
        self.check(result)
    }

    /// Marks a discovered ref as wanted and sends its `want` line.
    pub fn want(&mut self, name: &str) -> Result<()> {
        self.require(FetchState::Discovered, "want")?;
        let object_id = self
            .discovery
            .get(name)
            .map(|r| r.object_id)
            .ok_or_else(|| GitError::UnknownRef(name.to_string()))?;

        if !self.wanted.insert(object_id) {
            tracing::trace!(name, "object already wanted");
            return Ok(());
        }

        let line = if !self.capabilities_sent && !self.selected.is_empty() {
            format!("want {} {}\n", object_id, self.selected)
        } else {
            format!("want {}\n", object_id)
        };
        self.capabilities_sent = true;
        tracing::debug!(name, %object_id, "want");

        let result = self.writer.write_line(&line);
        self.check(result)
    }

    /// Marks the ref behind a fetchable handle as wanted.
    pub fn want_ref(&mut self, handle: &RefHandle) -> Result<()> {
        handle.require(RefAccess::Fetchable)?;
        self.want(&handle.name)
    }

    /// Ends the want section and starts receiving the pack.
    ///
    /// With nothing wanted a single flush is sent and the conversation ends.
    pub fn flush(&mut self) -> Result<()> {
        self.require(FetchState::Discovered, "flush")?;
        let result = self.send_request().and_then(|()| self.process());
        self.check(result)
    }

    fn send_request(&mut self) -> Result<()> {
        if self.wanted.is_empty() {
            self.writer.flush_pkt()?;
            self.writer.flush()?;
            tracing::debug!("nothing wanted");
            self.end();
            return Ok(());
        }

        if let Some(depth) = self.config.depth {
            if self.negotiated.contains(SHALLOW) {
                self.writer.write_line(&format!("deepen {}", depth))?;
            } else {
                tracing::warn!(depth, "server does not support shallow fetches");
            }
        }
        self.writer.flush_pkt()?;
        // Empty have section: the full history is always requested.
        self.writer.flush_pkt()?;
        self.writer.flush_pkt()?;
        self.writer.write_line("done")?;
        self.writer.flush()?;

        self.receive.side_band = self.negotiated.side_band().is_enabled();
        self.state = FetchState::Receiving;
        tracing::debug!(
            wants = self.wanted.len(),
            side_band = self.receive.side_band,
            "request sent"
        );
        Ok(())
    }

    fn process(&mut self) -> Result<()> {
        loop {
            match self.state {
                FetchState::Discovering => {
                    let Some(pkt) = self.decoder.next_packet()? else {
                        return Ok(());
                    };
                    if let Some(discovery) = self.parser.push_line(pkt)? {
                        self.on_discovered(discovery);
                    }
                }
                FetchState::Receiving => {
                    if !self.receive_step()? {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn on_discovered(&mut self, discovery: Discovery) {
        self.selected = select_fetch_capabilities(
            &discovery.capabilities,
            &self.config.capabilities,
            self.config.depth,
        );
        self.negotiated = CapabilitySet::parse(&self.selected);
        self.discovery = discovery;
        self.state = FetchState::Discovered;
        tracing::debug!(
            refs = self.discovery.refs.len(),
            selected = %self.selected,
            "fetch discovery complete"
        );
        self.events
            .emit(FetchEvent::Discover(self.discovery.clone()));
    }

    /// Consumes one unit of the receive phase. Returns false when more
    /// bytes are needed.
    fn receive_step(&mut self) -> Result<bool> {
        if self.receive.raw_mode {
            let bytes = self.decoder.take_remaining();
            self.receive.raw.extend_from_slice(&bytes);
            return Ok(false);
        }
        if !self.receive.side_band && self.decoder.starts_with(PACK_SIGNATURE) {
            tracing::trace!("raw pack data begins");
            self.receive.raw_mode = true;
            return Ok(true);
        }

        let Some(pkt) = self.decoder.next_packet()? else {
            return Ok(false);
        };
        match pkt {
            PktLine::Flush if self.receive.pack_started() => self.complete()?,
            PktLine::Flush => tracing::trace!("section flush before pack data"),
            PktLine::Data(data) => {
                if !self.receive.pack_started() && self.acknowledgement(&data)? {
                    return Ok(true);
                }
                if !self.receive.side_band {
                    return Err(GitError::Protocol(format!(
                        "unexpected line before pack data: {:?}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                self.demultiplex(data)?;
            }
        }
        Ok(true)
    }

    /// Handles NAK/ACK and shallow-update lines. Returns false for
    /// anything else.
    fn acknowledgement(&mut self, data: &[u8]) -> Result<bool> {
        let Ok(line) = std::str::from_utf8(data) else {
            return Ok(false);
        };
        let line = line.trim_end_matches('\n');

        if line == "NAK" {
            tracing::debug!("NAK");
        } else if let Some(rest) = line.strip_prefix("ACK ") {
            tracing::debug!(ack = rest, "ACK");
        } else if let Some(hex) = line.strip_prefix("shallow ") {
            self.receive.shallow.push(ObjectId::from_hex(hex.trim())?);
        } else if let Some(hex) = line.strip_prefix("unshallow ") {
            tracing::debug!(id = hex, "unshallow");
        } else if let Some(message) = line.strip_prefix("ERR ") {
            return Err(GitError::Remote(message.to_string()));
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn demultiplex(&mut self, data: Bytes) -> Result<()> {
        match self.receive.demux.push(data)? {
            Some(SideBandMessage::Progress(text)) => {
                tracing::trace!(progress = %text.trim_end());
                self.events.emit(FetchEvent::Progress(text));
            }
            Some(SideBandMessage::Error(text)) => {
                tracing::warn!(remote = %text.trim_end(), "remote reported an error");
                self.events.emit(FetchEvent::Error(text));
            }
            None => {}
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        let pack = if self.receive.raw_mode {
            std::mem::take(&mut self.receive.raw).freeze()
        } else {
            std::mem::take(&mut self.receive.demux).into_pack()
        };
        let objects = self.codec.decode(&pack)?;

        let refs = self
            .discovery
            .refs
            .iter()
            .filter(|(_, r)| r.kind != RefKind::Head && self.wanted.contains(&r.object_id))
            .filter_map(|(name, r)| {
                objects
                    .get(&r.object_id)
                    .map(|object| (name.clone(), object.clone()))
            })
            .collect();

        let result = FetchResult {
            refs,
            objects,
            shallow: std::mem::take(&mut self.receive.shallow),
        };
        tracing::info!(
            refs = result.refs.len(),
            objects = result.objects.len(),
            pack_bytes = pack.len(),
            "fetch complete"
        );

        self.state = FetchState::Fetched;
        self.events.emit(FetchEvent::Fetched(result.clone()));
        self.result = Some(result);
        self.events.emit(FetchEvent::End);
        Ok(())
    }

    fn end(&mut self) {
        self.state = FetchState::Ended;
        self.events.emit(FetchEvent::End);
    }

    fn require(&self, state: FetchState, action: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> GitError {
        GitError::InvalidState {
            action,
            state: self.state.to_string(),
        }
    }

    /// Moves to `Failed` on any non-local error.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if !err.is_local() {
                tracing::warn!(error = %err, state = %self.state, "fetch failed");
                self.state = FetchState::Failed;
            }
        }
        result
    }
}
