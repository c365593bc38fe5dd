//! Push conversation (receive-pack client).
//!
//! ```text
//! Discovering ──flush-pkt──▶ Discovered ──flush()──▶ Pushing ──status report──▶ Pushed
//!                                 │                     (skipped without report-status)
//!                                 └── flush() with no commands ──▶ Ended
//! ```
//!
//! Ref-update commands are written as soon as they are issued. Objects
//! introduced by updates and creates are held until `flush`, then packed
//! and sent after the command list.

use crate::capabilities::{select_push_capabilities, CapabilitySet, DELETE_REFS, REPORT_STATUS};
use crate::config::ConversationConfig;
use crate::discovery::{
    AdvertisedRef, Discovery, DiscoveryMode, DiscoveryParser, RefAccess, RefHandle, RefKind,
};
use crate::event::{self, EventReceiver, EventSink, PushEvent};
use crate::history::History;
use crate::pack::{PackCodec, PackfileCodec};
use crate::pktline::{PktLine, PktLineDecoder, PktLineWriter};
use crate::{GitError, Result};
use gitwire_objects::{GitObject, ObjectId};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

/// States of a push conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Reading the ref advertisement.
    Discovering,
    /// Advertisement read; accepting ref-update commands.
    Discovered,
    /// Commands and pack sent; reading the status report.
    Pushing,
    /// Report available.
    Pushed,
    /// Finished without sending commands.
    Ended,
    /// A fatal error occurred.
    Failed,
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "discovering",
            Self::Discovered => "discovered",
            Self::Pushing => "pushing",
            Self::Pushed => "pushed",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single `<old> <new> <ref>` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdateCommand {
    /// Current value on the server (zero for a create).
    pub old_id: ObjectId,
    /// Requested value (zero for a delete).
    pub new_id: ObjectId,
    /// Full ref name.
    pub ref_name: String,
}

impl RefUpdateCommand {
    /// Returns true if the command creates the ref.
    pub fn is_create(&self) -> bool {
        self.old_id.is_zero()
    }

    /// Returns true if the command deletes the ref.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }
}

impl fmt::Display for RefUpdateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old_id, self.new_id, self.ref_name)
    }
}

/// Outcome of unpacking the sent pack on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackStatus {
    /// `unpack ok`.
    Ok,
    /// `unpack <reason>`.
    Failed(String),
    /// The server was not asked for a report.
    Unreported,
}

/// Outcome of a single ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// `ok <ref>`.
    Ok,
    /// `ng <ref> <reason>`.
    Rejected(String),
    /// The server was not asked for a report.
    Unreported,
}

/// Status of one ref in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Full ref name.
    pub ref_name: String,
    /// Result for this ref.
    pub status: RefStatus,
}

/// Status report of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Unpack outcome.
    pub unpack: UnpackStatus,
    /// Per-ref outcomes in the order the server reported them.
    pub commands: Vec<CommandStatus>,
}

impl PushReport {
    fn unreported(commands: &[RefUpdateCommand]) -> Self {
        Self {
            unpack: UnpackStatus::Unreported,
            commands: commands
                .iter()
                .map(|command| CommandStatus {
                    ref_name: command.ref_name.clone(),
                    status: RefStatus::Unreported,
                })
                .collect(),
        }
    }

    /// Returns true unless unpacking failed or any ref was rejected.
    pub fn is_success(&self) -> bool {
        !matches!(self.unpack, UnpackStatus::Failed(_))
            && !self
                .commands
                .iter()
                .any(|c| matches!(c.status, RefStatus::Rejected(_)))
    }

    /// Rejected refs with their reasons.
    pub fn rejected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.commands.iter().filter_map(|c| match &c.status {
            RefStatus::Rejected(reason) => Some((c.ref_name.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

/// A single push over one duplex stream.
pub struct PushConversation<W> {
    state: PushState,
    config: ConversationConfig,
    decoder: PktLineDecoder,
    parser: DiscoveryParser,
    discovery: Discovery,
    selected: String,
    negotiated: CapabilitySet,
    commands: Vec<RefUpdateCommand>,
    objects: Vec<GitObject>,
    writer: PktLineWriter<W>,
    codec: Box<dyn PackCodec>,
    unpack: Option<UnpackStatus>,
    statuses: Vec<CommandStatus>,
    report: Option<PushReport>,
    events: EventSink<PushEvent>,
}

impl<W: Write> PushConversation<W> {
    /// Creates a conversation writing to `writer`, using the default pack codec.
    pub fn new(writer: W, config: ConversationConfig) -> (Self, EventReceiver<PushEvent>) {
        Self::with_codec(writer, config, PackfileCodec)
    }

    /// Creates a conversation with a custom pack codec.
    pub fn with_codec(
        writer: W,
        config: ConversationConfig,
        codec: impl PackCodec + 'static,
    ) -> (Self, EventReceiver<PushEvent>) {
        let (events, receiver) = event::channel();
        let conversation = Self {
            state: PushState::Discovering,
            config,
            decoder: PktLineDecoder::new(),
            parser: DiscoveryParser::new(DiscoveryMode::Push),
            discovery: Discovery::default(),
            selected: String::new(),
            negotiated: CapabilitySet::new(),
            commands: Vec::new(),
            objects: Vec::new(),
            writer: PktLineWriter::new(writer),
            codec: Box::new(codec),
            unpack: None,
            statuses: Vec::new(),
            report: None,
            events,
        };
        (conversation, receiver)
    }

    /// Current state.
    pub fn state(&self) -> PushState {
        self.state
    }

    /// Returns true once the conversation can make no further progress.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            PushState::Pushed | PushState::Ended | PushState::Failed
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

    /// Capability string sent with the first command.
    pub fn selected_capabilities(&self) -> &str {
        &self.selected
    }

    /// Pushable handles for every discovered branch and tag.
    pub fn handles(&self) -> Vec<RefHandle> {
        self.discovery.handles(RefAccess::Pushable)
    }

    /// Commands sent so far.
    pub fn commands(&self) -> &[RefUpdateCommand] {
        &self.commands
    }

    /// Report, once pushed.
    pub fn report(&self) -> Option<&PushReport> {
        self.report.as_ref()
    }

    /// Takes the report out of the conversation.
    pub fn take_report(&mut self) -> Option<PushReport> {
        self.report.take()
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
            PushState::Failed => return Err(self.invalid("receive")),
            PushState::Pushed | PushState::Ended => {
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
            PushState::Discovering => Err(GitError::UnexpectedEof(
                "stream closed during discovery".to_string(),
            )),
            PushState::Discovered if self.decoder.has_partial() => Err(
                GitError::UnexpectedEof("stream closed mid-frame".to_string()),
            ),
            PushState::Discovered => {
                tracing::debug!("stream closed after discovery");
                self.end();
                Ok(())
            }
            PushState::Pushing => Err(GitError::UnexpectedEof(
                "stream closed before the status report completed".to_string(),
            )),
            PushState::Pushed | PushState::Ended | PushState::Failed => Ok(()),
        };
        self.check(result)
    }

    /// Fast-forwards an existing ref by `history`.
    ///
    /// The oldest commit of the history gets the ref's current tip as parent.
    pub fn update(&mut self, name: &str, history: &History) -> Result<()> {
        self.require(PushState::Discovered, "update")?;
        let current = self.pushable(name)?;
        let old_id = current.object_id;
        // Annotated tags splice onto the commit they point at.
        let base = current.peeled.unwrap_or(old_id);
        let full_name = self.full_name(name)?;
        self.ensure_unqueued(&full_name)?;

        let spliced = history
            .splice_onto(Some(base))
            .ok_or_else(|| GitError::EmptyHistory(name.to_string()))?;
        self.queue(
            RefUpdateCommand {
                old_id,
                new_id: spliced.tip,
                ref_name: full_name,
            },
            spliced.objects,
        )
    }

    /// Deletes an existing ref.
    pub fn del(&mut self, name: &str) -> Result<()> {
        self.require(PushState::Discovered, "delete")?;
        let old_id = self.pushable(name)?.object_id;
        let full_name = self.full_name(name)?;
        if !self.negotiated.contains(DELETE_REFS) {
            return Err(GitError::Unsupported(format!(
                "deleting {} requires {}",
                full_name, DELETE_REFS
            )));
        }
        self.ensure_unqueued(&full_name)?;

        self.queue(
            RefUpdateCommand {
                old_id,
                new_id: ObjectId::zero(),
                ref_name: full_name,
            },
            Vec::new(),
        )
    }

    /// Creates `refs/heads/<name>` from a rootless history.
    pub fn create(&mut self, name: &str, history: &History) -> Result<()> {
        self.require(PushState::Discovered, "create")?;
        if self.discovery.get(name).is_some() {
            return Err(GitError::RefConflict(name.to_string()));
        }
        let full_name = RefKind::Branch.full_name(name);
        self.ensure_unqueued(&full_name)?;

        let spliced = history
            .splice_onto(None)
            .ok_or_else(|| GitError::EmptyHistory(name.to_string()))?;
        self.queue(
            RefUpdateCommand {
                old_id: ObjectId::zero(),
                new_id: spliced.tip,
                ref_name: full_name,
            },
            spliced.objects,
        )
    }

    /// Updates the ref behind a pushable handle.
    pub fn update_ref(&mut self, handle: &RefHandle, history: &History) -> Result<()> {
        handle.require(RefAccess::Pushable)?;
        self.update(&handle.name, history)
    }

    /// Deletes the ref behind a pushable handle.
    pub fn delete_ref(&mut self, handle: &RefHandle) -> Result<()> {
        handle.require(RefAccess::Pushable)?;
        self.del(&handle.name)
    }

    /// Ends the command list, sends the pack and starts reading the report.
    ///
    /// With no commands queued only the flush is sent and the conversation ends.
    pub fn flush(&mut self) -> Result<()> {
        self.require(PushState::Discovered, "flush")?;
        let result = self.send_pack().and_then(|()| self.process());
        self.check(result)
    }

    fn pushable(&self, name: &str) -> Result<&AdvertisedRef> {
        let advertised = self
            .discovery
            .get(name)
            .ok_or_else(|| GitError::UnknownRef(name.to_string()))?;
        if advertised.kind == RefKind::Head {
            return Err(GitError::InvalidHandle(format!("{} is not pushable", name)));
        }
        Ok(advertised)
    }

    fn full_name(&self, name: &str) -> Result<String> {
        Ok(self.pushable(name)?.kind.full_name(name))
    }

    fn ensure_unqueued(&self, ref_name: &str) -> Result<()> {
        if self.commands.iter().any(|c| c.ref_name == ref_name) {
            return Err(GitError::RefConflict(format!(
                "{} already has a queued command",
                ref_name
            )));
        }
        Ok(())
    }

    fn queue(&mut self, command: RefUpdateCommand, objects: Vec<GitObject>) -> Result<()> {
        let line = if self.commands.is_empty() {
            format!("{}\0{}\n", command, self.selected)
        } else {
            format!("{}\n", command)
        };
        tracing::debug!(%command, objects = objects.len(), "queue ref update");

        let result = self.writer.write_line(&line);
        self.check(result)?;
        self.commands.push(command);
        self.objects.extend(objects);
        Ok(())
    }

    fn send_pack(&mut self) -> Result<()> {
        self.writer.flush_pkt()?;
        if self.commands.is_empty() {
            self.writer.flush()?;
            tracing::debug!("no commands queued");
            self.end();
            return Ok(());
        }

        if !self.objects.is_empty() {
            let pack = self.codec.encode(&self.objects)?;
            tracing::debug!(objects = self.objects.len(), bytes = pack.len(), "sending pack");
            self.writer.write_raw(&pack)?;
        }
        self.writer.flush()?;

        if self.negotiated.contains(REPORT_STATUS) {
            self.state = PushState::Pushing;
        } else {
            tracing::debug!("no status report requested");
            let report = PushReport::unreported(&self.commands);
            self.complete(report);
        }
        Ok(())
    }

    fn process(&mut self) -> Result<()> {
        loop {
            if self.is_finished() {
                return Ok(());
            }
            let Some(pkt) = self.decoder.next_packet()? else {
                return Ok(());
            };

            match self.state {
                PushState::Discovering => {
                    if let Some(discovery) = self.parser.push_line(pkt)? {
                        self.on_discovered(discovery);
                    }
                }
                PushState::Discovered => match pkt {
                    // An empty repository's advertisement may still end with a flush.
                    PktLine::Flush => tracing::trace!("ignoring flush after advertisement"),
                    PktLine::Data(data) => {
                        return Err(GitError::Protocol(format!(
                            "unexpected line after advertisement: {:?}",
                            String::from_utf8_lossy(&data)
                        )))
                    }
                },
                _ => self.status_line(pkt)?,
            }
        }
    }

    fn on_discovered(&mut self, discovery: Discovery) {
        self.selected = select_push_capabilities(&discovery.capabilities, &self.config.capabilities);
        self.negotiated = CapabilitySet::parse(&self.selected);
        self.discovery = discovery;
        self.state = PushState::Discovered;
        tracing::debug!(
            refs = self.discovery.refs.len(),
            selected = %self.selected,
            "push discovery complete"
        );
        self.events.emit(PushEvent::Discover(self.discovery.clone()));
    }

    fn status_line(&mut self, pkt: PktLine) -> Result<()> {
        let data = match pkt {
            PktLine::Flush if self.unpack.is_none() => {
                tracing::trace!("ignoring flush before status report");
                return Ok(());
            }
            PktLine::Flush => {
                let report = PushReport {
                    unpack: self.unpack.take().unwrap_or(UnpackStatus::Unreported),
                    commands: std::mem::take(&mut self.statuses),
                };
                self.complete(report);
                return Ok(());
            }
            PktLine::Data(data) => data,
        };

        let line = std::str::from_utf8(&data)
            .map_err(|_| GitError::Protocol("status line is not UTF-8".to_string()))?
            .trim_end_matches('\n');

        if self.unpack.is_none() {
            self.unpack = Some(parse_unpack_status(line)?);
        } else {
            self.statuses.push(parse_command_status(line)?);
        }
        Ok(())
    }

    fn complete(&mut self, report: PushReport) {
        tracing::info!(
            success = report.is_success(),
            refs = report.commands.len(),
            "push complete"
        );
        self.state = PushState::Pushed;
        self.events.emit(PushEvent::Pushed(report.clone()));
        self.report = Some(report);
        self.events.emit(PushEvent::End);
    }

    fn end(&mut self) {
        self.state = PushState::Ended;
        self.events.emit(PushEvent::End);
    }

    fn require(&self, state: PushState, action: &'static str) -> Result<()> {
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
                tracing::warn!(error = %err, state = %self.state, "push failed");
                self.state = PushState::Failed;
            }
        }
        result
    }
}

fn parse_unpack_status(line: &str) -> Result<UnpackStatus> {
    if let Some(message) = line.strip_prefix("ERR ") {
        return Err(GitError::Remote(message.to_string()));
    }
    let status = line.strip_prefix("unpack ").unwrap_or(line);
    match status {
        "ok" => Ok(UnpackStatus::Ok),
        _ => match status.strip_prefix("ng ") {
            Some(reason) => Ok(UnpackStatus::Failed(reason.to_string())),
            None if line.starts_with("unpack ") => Ok(UnpackStatus::Failed(status.to_string())),
            None => Err(GitError::Protocol(format!("bad unpack status: {:?}", line))),
        },
    }
}

fn parse_command_status(line: &str) -> Result<CommandStatus> {
    if let Some(ref_name) = line.strip_prefix("ok ") {
        return Ok(CommandStatus {
            ref_name: ref_name.to_string(),
            status: RefStatus::Ok,
        });
    }
    if let Some(rest) = line.strip_prefix("ng ") {
        let (ref_name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
        return Ok(CommandStatus {
            ref_name: ref_name.to_string(),
            status: RefStatus::Rejected(reason.to_string()),
        });
    }
    Err(GitError::Protocol(format!("bad command status: {:?}", line)))
}
