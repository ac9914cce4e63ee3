use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Backend wire-protocol packet header (zero-copy).
///
/// Layout: `payload_length[3] | sequence_id[1]`, little-endian length.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < 4 {
            return Err(Error::ShortFrame {
                expected: 4,
                got: data.len(),
            });
        }
        Ok(Self::ref_from_bytes(&data[..4])?)
    }
}

/// Framing decoder for the backend wire protocol.
///
/// Driven either by a synchronous read loop (append bytes, call `decode()`
/// in a loop until it returns `None`) or by an async framed transport; the
/// decoder never performs I/O itself, so it never blocks.
///
/// When `track_sequence` is enabled, the decoder verifies that each
/// packet's sequence id is exactly one more than the previous packet's
/// (wrapping at 256), per connection. A gap is a `SequenceMismatch`,
/// fatal to the owning connection per §4.1. Call [`PacketDecoder::reset_sequence`]
/// at each new command boundary, where the protocol restarts numbering at 0.
pub struct PacketDecoder {
    state: DecoderState,
    expected_sequence_id: Option<u8>,
}

enum DecoderState {
    ReadingHeader,
    ReadingPayload { length: usize, sequence_id: u8 },
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader,
            expected_sequence_id: Some(0),
        }
    }

    /// Restart sequence-id tracking at a command boundary.
    pub fn reset_sequence(&mut self) {
        self.expected_sequence_id = Some(0);
    }

    /// Disable sequence-id validation (e.g. when multiplexing is handled
    /// by the caller and gaps are expected).
    pub fn disable_sequence_tracking(&mut self) {
        self.expected_sequence_id = None;
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketDecoder {
    type Item = (u8, BytesMut);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let length = src.get_uint_le(3) as usize;
                    let sequence_id = src.get_u8();

                    self.state = DecoderState::ReadingPayload {
                        length,
                        sequence_id,
                    };
                }
                DecoderState::ReadingPayload {
                    length,
                    sequence_id,
                } => {
                    if src.len() < length {
                        return Ok(None);
                    }

                    if let Some(expected) = self.expected_sequence_id {
                        if expected != sequence_id {
                            return Err(Error::SequenceMismatch {
                                expected,
                                got: sequence_id,
                            });
                        }
                    }
                    self.expected_sequence_id = self
                        .expected_sequence_id
                        .map(|expected| expected.wrapping_add(1));

                    let payload = src.split_to(length);
                    self.state = DecoderState::ReadingHeader;

                    return Ok(Some((sequence_id, payload)));
                }
            }
        }
    }
}

/// Write a packet header directly into an outgoing buffer.
#[inline]
pub fn write_packet_header(out: &mut Vec<u8>, sequence_id: u8, payload_length: usize) {
    let bytes = (payload_length as u32).to_le_bytes();
    out.extend_from_slice(&bytes[..3]);
    out.push(sequence_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_packet(buf: &mut BytesMut, sequence_id: u8, payload: &[u8]) {
        let mut header = Vec::new();
        write_packet_header(&mut header, sequence_id, payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
    }

    #[test]
    fn decodes_one_packet_across_arbitrary_split_points() {
        let mut full = BytesMut::new();
        push_packet(&mut full, 0, b"hello");
        let bytes: Vec<u8> = full.to_vec();

        for split in 0..=bytes.len() {
            let mut decoder = PacketDecoder::new();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&bytes[..split]);
            assert!(decoder.decode(&mut buf).unwrap().is_none() || split == bytes.len());
            buf.extend_from_slice(&bytes[split..]);
            let (seq, payload) = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(seq, 0);
            assert_eq!(&payload[..], b"hello");
        }
    }

    #[test]
    fn decodes_sequential_packets_in_order() {
        let mut buf = BytesMut::new();
        push_packet(&mut buf, 0, b"a");
        push_packet(&mut buf, 1, b"bb");
        push_packet(&mut buf, 2, b"ccc");

        let mut decoder = PacketDecoder::new();
        let (seq0, p0) = decoder.decode(&mut buf).unwrap().unwrap();
        let (seq1, p1) = decoder.decode(&mut buf).unwrap().unwrap();
        let (seq2, p2) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!((seq0, &p0[..]), (0, b"a".as_slice()));
        assert_eq!((seq1, &p1[..]), (1, b"bb".as_slice()));
        assert_eq!((seq2, &p2[..]), (2, b"ccc".as_slice()));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn sequence_gap_is_fatal() {
        let mut buf = BytesMut::new();
        push_packet(&mut buf, 0, b"a");
        push_packet(&mut buf, 5, b"b");

        let mut decoder = PacketDecoder::new();
        decoder.decode(&mut buf).unwrap().unwrap();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::SequenceMismatch {
                expected: 1,
                got: 5
            }
        ));
    }

    #[test]
    fn reset_sequence_restarts_numbering_at_command_boundary() {
        let mut buf = BytesMut::new();
        push_packet(&mut buf, 3, b"a");

        let mut decoder = PacketDecoder::new();
        decoder.expected_sequence_id = Some(3);
        let (seq, _) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(seq, 3);

        decoder.reset_sequence();
        push_packet(&mut buf, 0, b"b");
        let (seq, _) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(seq, 0);
    }

    #[test]
    fn header_from_bytes_rejects_short_input() {
        let err = PacketHeader::from_bytes(&[1, 2]).unwrap_err();
        assert!(matches!(err, Error::ShortFrame { expected: 4, got: 2 }));
    }
}
