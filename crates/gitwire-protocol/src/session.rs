//! Async drivers binding a conversation to a tokio stream.
//!
//! Conversations write into an in-memory buffer; the session copies that
//! buffer to the transport and feeds whatever it reads back into the
//! conversation until it reaches a terminal state.

use crate::config::ConversationConfig;
use crate::event::{EventReceiver, FetchEvent, PushEvent};
use crate::fetch::{FetchConversation, FetchResult, FetchState};
use crate::push::{PushConversation, PushReport, PushState};
use crate::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A conversation a [`Session`] can drive.
pub trait Conversation {
    /// Feeds received bytes.
    fn receive(&mut self, data: &[u8]) -> Result<()>;
    /// Signals end of stream.
    fn close(&mut self) -> Result<()>;
    /// Returns true while the ref advertisement is being read.
    fn is_discovering(&self) -> bool;
    /// Returns true once no further progress is possible.
    fn is_finished(&self) -> bool;
    /// Takes the bytes written since the last call.
    fn take_output(&mut self) -> Vec<u8>;
}

impl Conversation for FetchConversation<Vec<u8>> {
    fn receive(&mut self, data: &[u8]) -> Result<()> {
        FetchConversation::receive(self, data)
    }

    fn close(&mut self) -> Result<()> {
        FetchConversation::close(self)
    }

    fn is_discovering(&self) -> bool {
        self.state() == FetchState::Discovering
    }

    fn is_finished(&self) -> bool {
        FetchConversation::is_finished(self)
    }

    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.writer_mut())
    }
}

impl Conversation for PushConversation<Vec<u8>> {
    fn receive(&mut self, data: &[u8]) -> Result<()> {
        PushConversation::receive(self, data)
    }

    fn close(&mut self) -> Result<()> {
        PushConversation::close(self)
    }

    fn is_discovering(&self) -> bool {
        self.state() == PushState::Discovering
    }

    fn is_finished(&self) -> bool {
        PushConversation::is_finished(self)
    }

    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.writer_mut())
    }
}

/// A conversation bound to the read and write halves of a stream.
pub struct Session<C, R, W> {
    conversation: C,
    reader: R,
    writer: W,
    buf: Vec<u8>,
}

/// Fetch over an async stream.
pub type FetchSession<R, W> = Session<FetchConversation<Vec<u8>>, R, W>;

/// Push over an async stream.
pub type PushSession<R, W> = Session<PushConversation<Vec<u8>>, R, W>;

impl<C, R, W> Session<C, R, W>
where
    C: Conversation,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn start(conversation: C, reader: R, writer: W, chunk_size: usize) -> Result<Self> {
        let mut session = Self {
            conversation,
            reader,
            writer,
            buf: vec![0; chunk_size.max(1)],
        };
        while session.conversation.is_discovering() {
            session.read_some().await?;
        }
        Ok(session)
    }

    /// The driven conversation.
    pub fn conversation(&self) -> &C {
        &self.conversation
    }

    /// The driven conversation, for issuing caller actions.
    pub fn conversation_mut(&mut self) -> &mut C {
        &mut self.conversation
    }

    /// Reads one chunk. Returns false at end of stream.
    async fn read_some(&mut self) -> Result<bool> {
        let n = self.reader.read(&mut self.buf).await?;
        if n == 0 {
            tracing::trace!("transport closed");
            self.conversation.close()?;
            return Ok(false);
        }
        tracing::trace!(len = n, "transport read");
        self.conversation.receive(&self.buf[..n])?;
        Ok(true)
    }

    async fn send(&mut self) -> Result<()> {
        let output = self.conversation.take_output();
        if output.is_empty() {
            return Ok(());
        }
        tracing::trace!(len = output.len(), "transport write");
        self.writer.write_all(&output).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.send().await?;
        while !self.conversation.is_finished() {
            if !self.read_some().await? {
                break;
            }
        }
        Ok(())
    }
}

impl<R, W> FetchSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Reads the ref advertisement and returns the session with its events.
    pub async fn connect(
        reader: R,
        writer: W,
        config: ConversationConfig,
    ) -> Result<(Self, EventReceiver<FetchEvent>)> {
        let chunk_size = config.read_chunk_size;
        let (conversation, events) = FetchConversation::new(Vec::new(), config);
        let session = Self::start(conversation, reader, writer, chunk_size).await?;
        Ok((session, events))
    }

    /// Sends the request and reads until the fetch completes.
    ///
    /// Returns None when nothing was wanted.
    pub async fn finish(mut self) -> Result<Option<FetchResult>> {
        if self.conversation.state() == FetchState::Discovered {
            self.conversation.flush()?;
        }
        self.run().await?;
        Ok(self.conversation.take_result())
    }
}

impl<R, W> PushSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Reads the ref advertisement and returns the session with its events.
    pub async fn connect(
        reader: R,
        writer: W,
        config: ConversationConfig,
    ) -> Result<(Self, EventReceiver<PushEvent>)> {
        let chunk_size = config.read_chunk_size;
        let (conversation, events) = PushConversation::new(Vec::new(), config);
        let session = Self::start(conversation, reader, writer, chunk_size).await?;
        Ok((session, events))
    }

    /// Sends the commands and pack and reads the status report.
    ///
    /// Returns None when no commands were queued.
    pub async fn finish(mut self) -> Result<Option<PushReport>> {
        if self.conversation.state() == PushState::Discovered {
            self.conversation.flush()?;
        }
        self.run().await?;
        Ok(self.conversation.take_report())
    }
}
