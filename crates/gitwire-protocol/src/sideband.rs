//! Side-band demultiplexing.
//!
//! With `side-band` or `side-band-64k` negotiated, every data pkt-line of
//! the pack phase starts with a channel byte: 1 carries pack data, 2
//! progress text and 3 error text.

use crate::pktline::PktLine;
use crate::{GitError, Result};
use bytes::{Bytes, BytesMut};

/// A side-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Pack data.
    Pack,
    /// Progress messages for the user.
    Progress,
    /// Fatal error text from the remote.
    Error,
}

impl Channel {
    /// Returns the wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Pack => 1,
            Self::Progress => 2,
            Self::Error => 3,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = GitError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Channel::Pack),
            2 => Ok(Channel::Progress),
            3 => Ok(Channel::Error),
            other => Err(GitError::InvalidSideBand(other)),
        }
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideBandFrame {
    /// Channel the payload belongs to.
    pub channel: Channel,
    /// Payload without the channel byte.
    pub payload: Bytes,
}

impl SideBandFrame {
    /// Creates a frame.
    pub fn new(channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Splits a pkt-line payload into channel and data.
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(GitError::Protocol("empty side-band frame".to_string()));
        }
        let channel = Channel::try_from(data[0])?;
        let payload = data.split_off(1);
        Ok(Self { channel, payload })
    }

    /// Encodes the frame as a pkt-line.
    pub fn to_pkt_line(&self) -> PktLine {
        let mut data = Vec::with_capacity(self.payload.len() + 1);
        data.push(self.channel.tag());
        data.extend_from_slice(&self.payload);
        PktLine::Data(data.into())
    }
}

/// A non-pack message surfaced by the demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideBandMessage {
    /// Channel 2 text.
    Progress(String),
    /// Channel 3 text.
    Error(String),
}

/// Reassembles pack data from side-band frames in arrival order.
#[derive(Debug, Default)]
pub struct SideBandDemux {
    pack: BytesMut,
    frames: usize,
}

impl SideBandDemux {
    /// Creates an empty demultiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one data pkt-line payload.
    ///
    /// Pack data is appended to the internal buffer; progress and error text
    /// is returned to the caller.
    pub fn push(&mut self, data: Bytes) -> Result<Option<SideBandMessage>> {
        let frame = SideBandFrame::parse(data)?;
        self.frames += 1;
        let text = || String::from_utf8_lossy(&frame.payload).into_owned();
        Ok(match frame.channel {
            Channel::Pack => {
                self.pack.extend_from_slice(&frame.payload);
                None
            }
            Channel::Progress => Some(SideBandMessage::Progress(text())),
            Channel::Error => Some(SideBandMessage::Error(text())),
        })
    }

    /// Number of frames consumed so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Bytes of pack data collected so far.
    pub fn pack_len(&self) -> usize {
        self.pack.len()
    }

    /// Returns the concatenated pack data.
    pub fn into_pack(self) -> Bytes {
        self.pack.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Bytes {
        let mut data = vec![tag];
        data.extend_from_slice(payload);
        data.into()
    }

    #[test]
    fn test_demux_concatenates_pack_in_order() {
        let mut demux = SideBandDemux::new();
        assert_eq!(demux.push(frame(1, b"AA")).unwrap(), None);
        assert_eq!(
            demux.push(frame(2, b"progress")).unwrap(),
            Some(SideBandMessage::Progress("progress".to_string()))
        );
        assert_eq!(demux.push(frame(1, b"BB")).unwrap(), None);
        assert_eq!(demux.frames(), 3);
        assert_eq!(demux.pack_len(), 4);
        assert_eq!(demux.into_pack().as_ref(), b"AABB");
    }

    #[test]
    fn test_demux_error_channel() {
        let mut demux = SideBandDemux::new();
        assert_eq!(
            demux.push(frame(3, b"disk full\n")).unwrap(),
            Some(SideBandMessage::Error("disk full\n".to_string()))
        );
    }

    #[test]
    fn test_demux_rejects_unknown_channel() {
        let mut demux = SideBandDemux::new();
        for tag in [0u8, 4, b'N', 255] {
            assert!(matches!(
                demux.push(frame(tag, b"x")),
                Err(GitError::InvalidSideBand(t)) if t == tag
            ));
        }
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(SideBandFrame::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_frame_to_pkt_line() {
        let pkt = SideBandFrame::new(Channel::Progress, &b"hi"[..]).to_pkt_line();
        assert_eq!(pkt.encode(), b"0007\x02hi");
        let parsed = SideBandFrame::parse(Bytes::copy_from_slice(pkt.data().unwrap())).unwrap();
        assert_eq!(parsed.channel, Channel::Progress);
        assert_eq!(parsed.payload.as_ref(), b"hi");
    }

    #[test]
    fn test_channel_tags() {
        for channel in [Channel::Pack, Channel::Progress, Channel::Error] {
            assert_eq!(Channel::try_from(channel.tag()).unwrap(), channel);
        }
    }
}
