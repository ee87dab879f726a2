//! Packet-level assembly/parsing and fragmentation/reassembly (§4.1).
//!
//! A packet is `PacketHeader || [FragmentHeader] || message bytes || CRC32`. Below the MTU a
//! message travels as a single unfragmented packet; above it, the marshalled message is split
//! into word-aligned fragments each carrying its own packet header, fragment header and CRC, so
//! any individual fragment still round-trips through `parse_packet` on its own.

pub mod crc;
pub mod header;
pub mod message;

pub use message::Message;

use header::{FragmentHeader, PacketHeader, FRAGMENT_HEADER_LENGTH, PACKET_HEADER_LENGTH};

use crate::error::{Error, Result};

/// The result of parsing one raw datagram: either a complete message, or one fragment of a
/// larger message still being reassembled.
pub enum ParsedPacket {
    Complete {
        header: PacketHeader,
        message: Message,
    },
    Fragment {
        header: PacketHeader,
        fragment_header: FragmentHeader,
        data: Vec<u8>,
    },
}

/// Verify the trailing CRC, then split the packet header from whatever follows it.
pub fn parse_packet(raw: &[u8]) -> Result<ParsedPacket> {
    if !crc::verify(raw) {
        return Err(Error::InvalidPacket("CRC mismatch"));
    }
    let body = &raw[..raw.len() - crc::CRC_LENGTH];
    let mut cursor = std::io::Cursor::new(body);
    let header = PacketHeader::unmarshal(&mut cursor)?;

    if header.fragmented {
        let fragment_header = FragmentHeader::unmarshal(&mut cursor)?;
        let pos = cursor.position() as usize;
        Ok(ParsedPacket::Fragment {
            header,
            fragment_header,
            data: body[pos..].to_vec(),
        })
    } else {
        let pos = cursor.position() as usize;
        let mut msg_cursor = std::io::Cursor::new(&body[pos..]);
        let message = Message::unmarshal(&mut msg_cursor)?;
        Ok(ParsedPacket::Complete { header, message })
    }
}

/// Marshal `message`, split it into one or more raw packets that each fit within `mtu`, and
/// stamp every packet with `header` (fragment headers and the fragmented flag are filled in
/// here; `header.sequence_number` is shared by every fragment of the same message, matching how
/// a real retransmission only ever resends the whole set together).
pub fn build_packets(
    mut header: PacketHeader,
    message: &Message,
    mtu: usize,
    message_id: u16,
) -> Result<Vec<Vec<u8>>> {
    let mut message_bytes = Vec::new();
    message.marshal(&mut message_bytes)?;
    while message_bytes.len() % 4 != 0 {
        message_bytes.push(0);
    }

    let unfragmented_budget = mtu.saturating_sub(PACKET_HEADER_LENGTH + crc::CRC_LENGTH);
    if message_bytes.len() <= unfragmented_budget {
        header.fragmented = false;
        let mut packet = Vec::new();
        header.marshal(&mut packet)?;
        packet.extend_from_slice(&message_bytes);
        let crc_val = crc::compute(&packet);
        packet.extend_from_slice(&crc_val.to_be_bytes());
        return Ok(vec![packet]);
    }

    let raw_budget = mtu.saturating_sub(PACKET_HEADER_LENGTH + FRAGMENT_HEADER_LENGTH + crc::CRC_LENGTH);
    let fragment_budget = raw_budget - (raw_budget % 4);
    if fragment_budget == 0 {
        return Err(Error::InvalidContext("MTU too small to carry any fragment"));
    }

    let total_length_words = (message_bytes.len() / 4) as u16;
    header.fragmented = true;

    let mut packets = Vec::new();
    let mut offset = 0usize;
    while offset < message_bytes.len() {
        let len = fragment_budget.min(message_bytes.len() - offset);
        let fragment_header = FragmentHeader {
            message_id,
            total_length_words,
            offset_words: (offset / 4) as u16,
            fragment_length_words: (len / 4) as u16,
        };

        let mut packet = Vec::new();
        header.marshal(&mut packet)?;
        fragment_header.marshal(&mut packet)?;
        packet.extend_from_slice(&message_bytes[offset..offset + len]);
        let crc_val = crc::compute(&packet);
        packet.extend_from_slice(&crc_val.to_be_bytes());

        packets.push(packet);
        offset += len;
    }

    Ok(packets)
}

/// Per-channel fragment reassembly: one slot, keyed by message-id. A fragment whose message-id
/// is newer than the one in progress discards the partial buffer and starts over; a fragment
/// whose message-id is older is rejected as out of order (§4.1).
#[derive(Default)]
pub struct Reassembler {
    message_id: Option<u16>,
    total_len: usize,
    buffer: Vec<u8>,
    received_ranges: Vec<(usize, usize)>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// Feed one fragment. Returns the reassembled message bytes once every byte of it has
    /// arrived, `None` while reassembly is still in progress.
    pub fn push(&mut self, header: FragmentHeader, fragment_data: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.message_id {
            Some(current) if header.message_id < current => {
                return Err(Error::OutOfOrderFragment {
                    current,
                    got: header.message_id,
                });
            }
            Some(current) if header.message_id > current => {
                self.start(header.message_id, header.total_length_words);
            }
            None => self.start(header.message_id, header.total_length_words),
            _ => {}
        }

        let offset = header.offset_words as usize * 4;
        let end = offset + fragment_data.len();
        if end > self.buffer.len() {
            return Err(Error::InvalidPacket("fragment extends past total message length"));
        }
        self.buffer[offset..end].copy_from_slice(fragment_data);
        insert_range(&mut self.received_ranges, offset, end);

        if covers_whole(&self.received_ranges, self.total_len) {
            let complete = std::mem::take(&mut self.buffer);
            self.message_id = None;
            self.received_ranges.clear();
            Ok(Some(complete))
        } else {
            Ok(None)
        }
    }

    fn start(&mut self, message_id: u16, total_length_words: u16) {
        self.message_id = Some(message_id);
        self.total_len = total_length_words as usize * 4;
        self.buffer = vec![0u8; self.total_len];
        self.received_ranges.clear();
    }
}

fn insert_range(ranges: &mut Vec<(usize, usize)>, start: usize, end: usize) {
    ranges.push((start, end));
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (s, e) in ranges.drain(..) {
        if let Some(last) = merged.last_mut() {
            if s <= last.1 {
                last.1 = last.1.max(e);
                continue;
            }
        }
        merged.push((s, e));
    }
    *ranges = merged;
}

fn covers_whole(ranges: &[(usize, usize)], total_len: usize) -> bool {
    ranges.len() == 1 && ranges[0] == (0, total_len)
}

#[cfg(test)]
mod codec_test {
    use super::*;
    use crate::zid::Zid;

    fn sample_message() -> Message {
        Message::HelloAck(message::HelloAck)
    }

    #[test]
    fn unfragmented_round_trips() {
        let header = PacketHeader {
            fragmented: false,
            sequence_number: 1,
            source_ssrc: 0x1234,
        };
        let packets = build_packets(header, &sample_message(), 1452, 0).unwrap();
        assert_eq!(packets.len(), 1);

        match parse_packet(&packets[0]).unwrap() {
            ParsedPacket::Complete { message, .. } => {
                assert!(matches!(message, Message::HelloAck(_)));
            }
            ParsedPacket::Fragment { .. } => panic!("expected a complete packet"),
        }
    }

    #[test]
    fn fragmented_message_reassembles() {
        let hello = message::Hello {
            version: *b"1.10",
            client_id: *b"zrtp-core-test  ",
            h3: [3u8; message::H_IMAGE_LENGTH],
            zid: Zid::random(),
            flags: message::HelloFlags::default(),
            hash: vec![crate::negotiation::HashAlgo::Sha256],
            cipher: vec![crate::negotiation::CipherAlgo::Aes1Cfb],
            auth_tag: vec![crate::negotiation::AuthTagAlgo::HmacSha132],
            key_agreement: vec![crate::negotiation::KeyAgreementAlgo::Dh3072],
            sas: vec![crate::negotiation::SasAlgo::Base32],
            mac: [0u8; message::MAC_LENGTH],
        };
        let message = Message::Hello(hello);

        let header = PacketHeader {
            fragmented: false,
            sequence_number: 7,
            source_ssrc: 0xabcd,
        };
        // Small enough MTU that the Hello message must be split across several fragments.
        let packets = build_packets(header, &message, 40, 5).unwrap();
        assert!(packets.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut complete = None;
        for raw in &packets {
            match parse_packet(raw).unwrap() {
                ParsedPacket::Fragment {
                    fragment_header,
                    data,
                    ..
                } => {
                    if let Some(bytes) = reassembler.push(fragment_header, &data).unwrap() {
                        complete = Some(bytes);
                    }
                }
                ParsedPacket::Complete { .. } => panic!("expected fragments"),
            }
        }

        let complete = complete.expect("reassembly should have completed");
        let mut cursor = std::io::Cursor::new(&complete);
        let reassembled = Message::unmarshal(&mut cursor).unwrap();
        assert!(matches!(reassembled, Message::Hello(_)));
    }

    #[test]
    fn older_message_id_is_rejected_as_out_of_order() {
        let mut reassembler = Reassembler::new();
        let first = FragmentHeader {
            message_id: 5,
            total_length_words: 4,
            offset_words: 0,
            fragment_length_words: 2,
        };
        reassembler.push(first, &[0u8; 8]).unwrap();

        let stale = FragmentHeader {
            message_id: 4,
            total_length_words: 4,
            offset_words: 0,
            fragment_length_words: 2,
        };
        assert!(reassembler.push(stale, &[0u8; 8]).is_err());
    }
}
