//! The 12-byte ZRTP packet header and the 8-byte fragmentation header inserted after it for
//! fragmented packets (§4.1).

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const PACKET_HEADER_LENGTH: usize = 12;
pub const FRAGMENT_HEADER_LENGTH: usize = 8;

pub const PREAMBLE_NORMAL: u8 = 0x10;
pub const PREAMBLE_FRAGMENTED: u8 = 0x11;
pub const MAGIC_COOKIE: u32 = 0x5a52_5450;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PacketHeader {
    pub fragmented: bool,
    pub sequence_number: u16,
    pub source_ssrc: u32,
}

impl PacketHeader {
    pub fn size(&self) -> usize {
        PACKET_HEADER_LENGTH
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(if self.fragmented {
            PREAMBLE_FRAGMENTED
        } else {
            PREAMBLE_NORMAL
        })?;
        writer.write_u8(0)?;
        writer.write_u16::<BigEndian>(self.sequence_number)?;
        writer.write_u32::<BigEndian>(MAGIC_COOKIE)?;
        writer.write_u32::<BigEndian>(self.source_ssrc)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let preamble = reader.read_u8()?;
        let fragmented = match preamble {
            PREAMBLE_NORMAL => false,
            PREAMBLE_FRAGMENTED => true,
            _ => return Err(Error::InvalidPacket("bad preamble byte")),
        };
        let _zero = reader.read_u8()?;
        let sequence_number = reader.read_u16::<BigEndian>()?;
        let cookie = reader.read_u32::<BigEndian>()?;
        if cookie != MAGIC_COOKIE {
            return Err(Error::InvalidPacket("bad magic cookie"));
        }
        let source_ssrc = reader.read_u32::<BigEndian>()?;
        Ok(PacketHeader {
            fragmented,
            sequence_number,
            source_ssrc,
        })
    }

    /// Rewrite the sequence number in an already-built packet without touching the message
    /// bytes, then recompute the trailing CRC (§4.1 `set_sequence_number`). `packet` must be a
    /// complete, previously-built packet (header + message + CRC).
    pub fn rewrite_sequence_number(packet: &mut [u8], n: u16) -> Result<()> {
        if packet.len() < PACKET_HEADER_LENGTH + 4 {
            return Err(Error::InvalidPacket("packet too short to rewrite"));
        }
        packet[2..4].copy_from_slice(&n.to_be_bytes());
        let crc = super::crc::compute(&packet[..packet.len() - 4]);
        let len = packet.len();
        packet[len - 4..].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }
}

/// Present only when `PacketHeader::fragmented` is set.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FragmentHeader {
    pub message_id: u16,
    pub total_length_words: u16,
    pub offset_words: u16,
    pub fragment_length_words: u16,
}

impl FragmentHeader {
    pub fn size(&self) -> usize {
        FRAGMENT_HEADER_LENGTH
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.message_id)?;
        writer.write_u16::<BigEndian>(self.total_length_words)?;
        writer.write_u16::<BigEndian>(self.offset_words)?;
        writer.write_u16::<BigEndian>(self.fragment_length_words)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(FragmentHeader {
            message_id: reader.read_u16::<BigEndian>()?,
            total_length_words: reader.read_u16::<BigEndian>()?,
            offset_words: reader.read_u16::<BigEndian>()?,
            fragment_length_words: reader.read_u16::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod header_test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips() {
        let header = PacketHeader {
            fragmented: false,
            sequence_number: 42,
            source_ssrc: 0xdead_beef,
        };
        let mut buf = Vec::new();
        header.marshal(&mut buf).unwrap();
        assert_eq!(buf.len(), PACKET_HEADER_LENGTH);

        let mut cursor = Cursor::new(&buf);
        let parsed = PacketHeader::unmarshal(&mut cursor).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let mut buf = vec![PREAMBLE_NORMAL, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = Cursor::new(&mut buf);
        assert!(PacketHeader::unmarshal(&mut cursor).is_err());
    }
}
