//! Git pkt-line format implementation.
//!
//! Every protocol message is framed as a pkt-line: a 4-character lowercase
//! hex length (which counts the 4 header bytes themselves) followed by the
//! payload, or `0000` for a flush packet.
//!
//! Transports deliver bytes in arbitrary chunks, so decoding goes through
//! [`PktLineDecoder`], which buffers input and yields a packet only once it
//! is complete.

use crate::{GitError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Write;

/// Largest pkt-line, header included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest pkt-line payload.
pub const MAX_PKT_DATA_LEN: usize = MAX_PKT_LEN - 4;

const HEADER_LEN: usize = 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Bytes),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Bytes>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + HEADER_LEN;
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for a flush.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Parses a 4-byte hex length header.
fn parse_length(header: &[u8]) -> Result<usize> {
    let mut len = 0usize;
    for &byte in header {
        let digit = (byte as char).to_digit(16).ok_or_else(|| {
            GitError::InvalidPktLine(format!(
                "non-hex length {:?}",
                String::from_utf8_lossy(header)
            ))
        })?;
        len = (len << 4) | digit as usize;
    }
    Ok(len)
}

/// Incremental pkt-line decoder.
///
/// Bytes are appended with [`feed`](Self::feed) as they arrive; each call
/// to [`next_packet`](Self::next_packet) consumes at most one complete
/// packet and returns `Ok(None)` when more bytes are needed.
#[derive(Debug, Default)]
pub struct PktLineDecoder {
    buf: BytesMut,
}

impl PktLineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decodes the next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Result<Option<PktLine>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = parse_length(&self.buf[..HEADER_LEN])?;
        match len {
            0 => {
                self.buf.advance(HEADER_LEN);
                tracing::trace!("pkt-line flush");
                Ok(Some(PktLine::Flush))
            }
            1..=3 => Err(GitError::InvalidPktLine(format!(
                "length {} is smaller than the header",
                len
            ))),
            len if len > MAX_PKT_LEN => Err(GitError::InvalidPktLine(format!(
                "length {} exceeds maximum {}",
                len, MAX_PKT_LEN
            ))),
            len => {
                if self.buf.len() < len {
                    return Ok(None);
                }
                self.buf.advance(HEADER_LEN);
                let data = self.buf.split_to(len - HEADER_LEN).freeze();
                tracing::trace!(len = data.len(), "pkt-line data");
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Returns true if bytes of an unfinished packet are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of buffered, undecoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if the undecoded bytes start with `prefix`.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.buf.starts_with(prefix)
    }

    /// Drains every buffered byte without decoding it.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.len() > MAX_PKT_DATA_LEN {
                return Err(GitError::InvalidPktLine(format!(
                    "payload of {} bytes exceeds maximum {}",
                    data.len(),
                    MAX_PKT_DATA_LEN
                )));
            }
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(Bytes::copy_from_slice(data)))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data.into()))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Writes bytes without pkt-line framing (pack data).
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a reference to the inner writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Returns a mutable reference to the inner writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<PktLine>> {
        let mut decoder = PktLineDecoder::new();
        decoder.feed(bytes);
        let mut packets = Vec::new();
        while let Some(pkt) = decoder.next_packet()? {
            packets.push(pkt);
        }
        Ok(packets)
    }

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
    }

    #[test]
    fn test_pktline_empty_data() {
        let encoded = PktLine::from_bytes(Vec::new()).encode();
        assert_eq!(encoded, b"0004");
    }

    #[test]
    fn test_pktline_lowercase_header() {
        let data = vec![b'x'; 0xab - 4];
        let encoded = PktLine::from_bytes(data).encode();
        assert_eq!(&encoded[..4], b"00ab");
    }

    #[test]
    fn test_pktline_data_accessors() {
        let pkt = PktLine::from_string("hello\n");
        assert_eq!(pkt.data(), Some(b"hello\n".as_slice()));
        assert_eq!(pkt.as_str(), Some("hello"));
        assert!(!pkt.is_flush());

        assert!(PktLine::Flush.is_flush());
        assert!(PktLine::Flush.data().is_none());
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
    }

    #[test]
    fn test_decoder_reads_sequence() {
        let packets = decode_all(b"000ahello\n0000000aworld\n").unwrap();
        assert_eq!(
            packets,
            vec![
                PktLine::from_string("hello\n"),
                PktLine::Flush,
                PktLine::from_string("world\n"),
            ]
        );
    }

    #[test]
    fn test_decoder_waits_for_split_header() {
        let mut decoder = PktLineDecoder::new();
        decoder.feed(b"00");
        assert_eq!(decoder.next_packet().unwrap(), None);
        assert!(decoder.has_partial());
        decoder.feed(b"0ahel");
        assert_eq!(decoder.next_packet().unwrap(), None);
        decoder.feed(b"lo\n");
        assert_eq!(
            decoder.next_packet().unwrap(),
            Some(PktLine::from_string("hello\n"))
        );
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_accepts_uppercase_hex() {
        let mut bytes = b"001A".to_vec();
        bytes.extend_from_slice(&[b'y'; 0x1a - 4]);
        let packets = decode_all(&bytes).unwrap();
        assert_eq!(packets[0].data().unwrap().len(), 0x1a - 4);
    }

    #[test]
    fn test_decoder_rejects_non_hex() {
        assert!(matches!(
            decode_all(b"00g4"),
            Err(GitError::InvalidPktLine(_))
        ));
        assert!(decode_all(b"+004").is_err());
    }

    #[test]
    fn test_decoder_rejects_short_lengths() {
        for header in [b"0001", b"0002", b"0003"] {
            assert!(decode_all(header).is_err());
        }
    }

    #[test]
    fn test_decoder_rejects_oversized_length() {
        assert!(decode_all(b"fff1").is_err());
    }

    #[test]
    fn test_decoder_take_remaining() {
        let mut decoder = PktLineDecoder::new();
        decoder.feed(b"0008NAK\nPACKxyz");
        assert_eq!(
            decoder.next_packet().unwrap(),
            Some(PktLine::from_string("NAK\n"))
        );
        assert!(decoder.starts_with(b"PACK"));
        assert_eq!(decoder.buffered(), 7);
        assert_eq!(decoder.take_remaining().as_ref(), b"PACKxyz");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_writer_write_line() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("test").unwrap();
        writer.write_line("again\n").unwrap();
        writer.flush_pkt().unwrap();
        assert_eq!(writer.into_inner(), b"0009test\n000aagain\n0000");
    }

    #[test]
    fn test_writer_rejects_oversized_payload() {
        let mut writer = PktLineWriter::new(Vec::new());
        let result = writer.write_data(&vec![0u8; MAX_PKT_DATA_LEN + 1]);
        assert!(result.is_err());
        assert!(writer.get_ref().is_empty());
        writer.write_data(&vec![0u8; MAX_PKT_DATA_LEN]).unwrap();
        assert_eq!(&writer.get_ref()[..4], b"fff0");
    }

    #[test]
    fn test_writer_raw() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_raw(b"PACK").unwrap();
        writer.flush().unwrap();
        writer.get_mut().push(b'!');
        assert_eq!(writer.into_inner(), b"PACK!");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: decode(encode(p)) == p and the header is len + 4.
        #[test]
        fn prop_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = PktLine::from_bytes(payload.clone()).encode();
            let header = format!("{:04x}", payload.len() + 4);
            prop_assert_eq!(&encoded[..4], header.as_bytes());

            let mut decoder = PktLineDecoder::new();
            decoder.feed(&encoded);
            let decoded = decoder.next_packet().unwrap().unwrap();
            prop_assert_eq!(decoded.data().unwrap(), payload.as_slice());
            prop_assert!(!decoder.has_partial());
        }

        /// Property: chunking the input never changes the decoded packets.
        #[test]
        fn prop_chunking_independent(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..10),
            chunk in 1usize..17,
        ) {
            let mut stream = Vec::new();
            for p in &payloads {
                stream.extend(PktLine::from_bytes(p.clone()).encode());
            }
            stream.extend(PktLine::Flush.encode());

            let mut decoder = PktLineDecoder::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.feed(piece);
                while let Some(pkt) = decoder.next_packet().unwrap() {
                    decoded.push(pkt);
                }
            }

            prop_assert_eq!(decoded.len(), payloads.len() + 1);
            for (pkt, p) in decoded.iter().zip(&payloads) {
                prop_assert_eq!(pkt.data().unwrap(), p.as_slice());
            }
            prop_assert!(decoded.last().unwrap().is_flush());
        }

        /// Property: arbitrary input never panics the decoder.
        #[test]
        fn prop_arbitrary_input_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut decoder = PktLineDecoder::new();
            decoder.feed(&data);
            for _ in 0..64 {
                match decoder.next_packet() {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}
