//! Conversation notifications.
//!
//! Each conversation owns the sending half of an unbounded channel and
//! emits typed events in protocol order. Callers that drop the receiver
//! simply stop observing; the conversation keeps running.

use crate::discovery::Discovery;
use crate::fetch::FetchResult;
use crate::push::PushReport;
use tokio::sync::mpsc;

/// Notifications produced by a fetch conversation.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Discovery completed.
    Discover(Discovery),
    /// Side-band progress text.
    Progress(String),
    /// Side-band error text.
    Error(String),
    /// The pack was received and decoded.
    Fetched(FetchResult),
    /// The conversation is over.
    End,
}

/// Notifications produced by a push conversation.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// Discovery completed.
    Discover(Discovery),
    /// The status report was received.
    Pushed(PushReport),
    /// The conversation is over.
    End,
}

/// Receiving half of a conversation's event channel.
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

/// Sending half held by a conversation.
#[derive(Debug)]
pub(crate) struct EventSink<E> {
    sender: mpsc::UnboundedSender<E>,
}

impl<E> EventSink<E> {
    pub(crate) fn emit(&self, event: E) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

/// Creates a connected sink and receiver.
pub(crate) fn channel<E>() -> (EventSink<E>, EventReceiver<E>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSink { sender }, receiver)
}
