//! Length-prefix reassembly: turns a stream of arbitrary-sized chunks from
//! the transport into complete [`Packet`]s, resynchronizing one byte at a
//! time when the header at the front of the buffer is invalid.

use crate::protocol::{decode_header, Packet, HEADER_LEN};

/// Append-only byte accumulator owned by the USB pump worker.
///
/// Invariant: after [`ReassemblyBuffer::feed`] returns, either the buffer
/// holds fewer than `HEADER_LEN` bytes, or its first `HEADER_LEN` bytes are
/// the header of a not-yet-complete packet.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
    resync_count: u64,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of one-byte resync advances performed so far (for diagnostics).
    pub fn resync_count(&self) -> u64 {
        self.resync_count
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk of ingress bytes and drain as many complete packets as
    /// are now available. Returns them in ingress byte order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let header = match decode_header(&self.buf[..HEADER_LEN]) {
                Some(h) => h,
                None => {
                    // Invalid header: resync by exactly one byte.
                    self.buf.remove(0);
                    self.resync_count += 1;
                    continue;
                }
            };
            let need = HEADER_LEN + header.length as usize;
            if self.buf.len() < need {
                break;
            }
            let payload = self.buf[HEADER_LEN..need].to_vec();
            self.buf.drain(0..need);
            out.push(Packet {
                kind: header.kind,
                payload,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_header, encode_packet, PacketType};

    #[test]
    fn resynchronizes_past_one_bad_byte() {
        let mut buf = ReassemblyBuffer::new();
        let mut stream = vec![0xAA];
        stream.extend_from_slice(&encode_packet(PacketType::Audio, &[1, 2, 3]));
        let packets = buf.feed(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::Audio);
        assert_eq!(packets[0].payload, vec![1, 2, 3]);
        assert_eq!(buf.resync_count(), 1);
    }

    #[test]
    fn oversize_header_advances_by_one_byte() {
        let mut buf = ReassemblyBuffer::new();
        let bytes = [0x01, 0xFF, 0xFF, 0xFF, 0xFF];
        let packets = buf.feed(&bytes);
        assert!(packets.is_empty());
        // One byte consumed via resync; the remaining 4 bytes are too short
        // for a header so they stay buffered.
        assert_eq!(buf.buffered_len(), 4);
        assert_eq!(buf.resync_count(), 1);
    }

    #[test]
    fn waits_for_more_bytes_on_incomplete_payload() {
        let mut buf = ReassemblyBuffer::new();
        let full = encode_packet(PacketType::Video, &[1, 2, 3, 4]);
        let (head, tail) = full.split_at(HEADER_LEN + 2);
        assert!(buf.feed(head).is_empty());
        assert_eq!(buf.buffered_len(), head.len());
        let packets = buf.feed(tail);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, vec![1, 2, 3, 4]);
        assert_eq!(buf.buffered_len(), 0);
    }

    #[test]
    fn multiple_packets_in_one_chunk() {
        let mut buf = ReassemblyBuffer::new();
        let mut stream = encode_packet(PacketType::Video, &[1, 2]);
        stream.extend_from_slice(&encode_packet(PacketType::Audio, &[9]));
        stream.extend_from_slice(&encode_packet(PacketType::Heartbeat, &[]));
        let packets = buf.feed(&stream);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].kind, PacketType::Video);
        assert_eq!(packets[1].kind, PacketType::Audio);
        assert_eq!(packets[2].kind, PacketType::Heartbeat);
        assert_eq!(buf.buffered_len(), 0);
    }

    #[test]
    fn round_trip_serialize_then_demux() {
        let packets_in = vec![
            (PacketType::Video, vec![1u8, 2, 3]),
            (PacketType::Config, vec![0x01, 0xAA, 0xBB]),
            (PacketType::Audio, vec![]),
        ];
        let mut stream = Vec::new();
        for (kind, payload) in &packets_in {
            stream.extend_from_slice(&encode_packet(*kind, payload));
        }
        let mut buf = ReassemblyBuffer::new();
        let out = buf.feed(&stream);
        assert_eq!(out.len(), packets_in.len());
        for (got, (kind, payload)) in out.iter().zip(packets_in.iter()) {
            assert_eq!(got.kind, *kind);
            assert_eq!(&got.payload, payload);
        }
    }

    #[test]
    fn feed_consumes_exact_byte_accounting() {
        let mut buf = ReassemblyBuffer::new();
        let p1 = encode_packet(PacketType::Video, &[0u8; 10]);
        let p2 = encode_packet(PacketType::Audio, &[0u8; 20]);
        let mut stream = p1.clone();
        stream.extend_from_slice(&p2);
        // Leave a dangling partial header at the end.
        stream.push(encode_header(PacketType::Video, 99)[0]);
        let consumed_before = stream.len();
        let out = buf.feed(&stream);
        assert_eq!(out.len(), 2);
        // Exactly the trailing 1 byte (start of a new header) remains.
        assert_eq!(buf.buffered_len(), consumed_before - p1.len() - p2.len());
    }

    #[test]
    fn feed_empty_chunk_is_noop() {
        let mut buf = ReassemblyBuffer::new();
        assert!(buf.feed(&[]).is_empty());
        assert_eq!(buf.buffered_len(), 0);
    }
}
