//! ZRTP message bodies (§4.1): the 8-byte-tagged payload carried inside a packet, fully parsed
//! to strongly typed structures. Field ordering and endianness follow §4.1; exact bit packing
//! of the Hello flags/counts and of the Confirm encrypted block are this crate's own choice
//! where §4.1 describes the fields without prescribing byte offsets.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use subtle::ConstantTimeEq;

use crate::crypto::{Cipher, Hmac};
use crate::error::{Error, Result};
use crate::negotiation::{AuthTagAlgo, CipherAlgo, HashAlgo, KeyAgreementAlgo, SasAlgo};
use crate::zid::Zid;

pub const MESSAGE_PREAMBLE: u16 = 0x505a;
pub const MAC_LENGTH: usize = 8;
pub const H_IMAGE_LENGTH: usize = 32;

pub type Tag = [u8; 8];

pub const TAG_HELLO: Tag = *b"Hello   ";
pub const TAG_HELLO_ACK: Tag = *b"HelloACK";
pub const TAG_COMMIT: Tag = *b"Commit  ";
pub const TAG_DH_PART1: Tag = *b"DHPart1 ";
pub const TAG_DH_PART2: Tag = *b"DHPart2 ";
pub const TAG_CONFIRM1: Tag = *b"Confirm1";
pub const TAG_CONFIRM2: Tag = *b"Confirm2";
pub const TAG_CONF2_ACK: Tag = *b"Conf2ACK";
pub const TAG_ERROR: Tag = *b"Error   ";
pub const TAG_ERROR_ACK: Tag = *b"ErrorACK";
pub const TAG_PING: Tag = *b"Ping    ";
pub const TAG_PING_ACK: Tag = *b"PingACK ";
pub const TAG_SAS_RELAY: Tag = *b"SASrelay";
pub const TAG_GO_CLEAR: Tag = *b"GoClear ";
pub const TAG_CLEAR_ACK: Tag = *b"ClearACK";

fn read_exact_vec<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HelloFlags {
    pub signed: bool,
    pub pbx: bool,
    pub passive: bool,
}

impl HelloFlags {
    fn to_byte(&self) -> u8 {
        (self.signed as u8) | ((self.pbx as u8) << 1) | ((self.passive as u8) << 2)
    }

    fn from_byte(b: u8) -> Self {
        HelloFlags {
            signed: b & 0x01 != 0,
            pbx: b & 0x02 != 0,
            passive: b & 0x04 != 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Hello {
    pub version: [u8; 4],
    pub client_id: [u8; 16],
    pub h3: [u8; H_IMAGE_LENGTH],
    pub zid: Zid,
    pub flags: HelloFlags,
    pub hash: Vec<HashAlgo>,
    pub cipher: Vec<CipherAlgo>,
    pub auth_tag: Vec<AuthTagAlgo>,
    pub key_agreement: Vec<KeyAgreementAlgo>,
    pub sas: Vec<SasAlgo>,
    pub mac: [u8; MAC_LENGTH],
}

fn clamp7(n: usize) -> u8 {
    n.min(7) as u8
}

impl Hello {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.version)?;
        writer.write_all(&self.client_id)?;
        writer.write_all(&self.h3)?;
        self.zid.marshal(writer)?;
        writer.write_u8(self.flags.to_byte())?;
        writer.write_u8(clamp7(self.hash.len()))?;
        writer.write_u8(clamp7(self.cipher.len()))?;
        writer.write_u8(clamp7(self.auth_tag.len()))?;
        writer.write_u8(clamp7(self.key_agreement.len()))?;
        writer.write_u8(clamp7(self.sas.len()))?;
        for a in self.hash.iter().take(7) {
            writer.write_all(&a.tag())?;
        }
        for a in self.cipher.iter().take(7) {
            writer.write_all(&a.tag())?;
        }
        for a in self.auth_tag.iter().take(7) {
            writer.write_all(&a.tag())?;
        }
        for a in self.key_agreement.iter().take(7) {
            writer.write_all(&a.tag())?;
        }
        for a in self.sas.iter().take(7) {
            writer.write_all(&a.tag())?;
        }
        writer.write_all(&self.mac)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let version = read_array(reader)?;
        let client_id = read_array(reader)?;
        let h3 = read_array(reader)?;
        let zid = Zid::unmarshal(reader)?;
        let flags = HelloFlags::from_byte(reader.read_u8()?);
        let hc = reader.read_u8()? as usize;
        let cc = reader.read_u8()? as usize;
        let ac = reader.read_u8()? as usize;
        let kc = reader.read_u8()? as usize;
        let sc = reader.read_u8()? as usize;
        if hc > 7 || cc > 7 || ac > 7 || kc > 7 || sc > 7 {
            return Err(Error::InvalidPacket("Hello algorithm count exceeds 7"));
        }

        let mut hash = Vec::with_capacity(hc);
        for _ in 0..hc {
            hash.push(HashAlgo::from(read_array::<_, 4>(reader)?));
        }
        let mut cipher = Vec::with_capacity(cc);
        for _ in 0..cc {
            cipher.push(CipherAlgo::from(read_array::<_, 4>(reader)?));
        }
        let mut auth_tag = Vec::with_capacity(ac);
        for _ in 0..ac {
            auth_tag.push(AuthTagAlgo::from(read_array::<_, 4>(reader)?));
        }
        let mut key_agreement = Vec::with_capacity(kc);
        for _ in 0..kc {
            key_agreement.push(KeyAgreementAlgo::from(read_array::<_, 4>(reader)?));
        }
        let mut sas = Vec::with_capacity(sc);
        for _ in 0..sc {
            sas.push(SasAlgo::from(read_array::<_, 4>(reader)?));
        }

        let mac = read_array(reader)?;

        Ok(Hello {
            version,
            client_id,
            h3,
            zid,
            flags,
            hash,
            cipher,
            auth_tag,
            key_agreement,
            sas,
            mac,
        })
    }

    /// Hello advertises multistream support if Multistream is among its key-agreement entries.
    pub fn advertises_multistream(&self) -> bool {
        self.key_agreement
            .iter()
            .any(|k| matches!(k, KeyAgreementAlgo::Multistream))
    }
}

#[derive(Clone, Debug)]
pub struct HelloAck;

impl HelloAck {
    pub fn marshal<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    pub fn unmarshal<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(HelloAck)
    }
}

#[derive(Clone, Debug)]
pub enum CommitVariant {
    Dh {
        hvi: [u8; H_IMAGE_LENGTH],
    },
    DhKem {
        hvi: [u8; H_IMAGE_LENGTH],
        kem_public: Vec<u8>,
    },
    MultiOrPreshared {
        nonce: [u8; 16],
        key_id: Option<[u8; 8]>,
    },
}

#[derive(Clone, Debug)]
pub struct Commit {
    pub h2: [u8; H_IMAGE_LENGTH],
    pub zid: Zid,
    pub hash: HashAlgo,
    pub cipher: CipherAlgo,
    pub auth_tag: AuthTagAlgo,
    pub key_agreement: KeyAgreementAlgo,
    pub sas: SasAlgo,
    pub variant: CommitVariant,
    /// HMAC-SHA-256(H1, body) truncated to `MAC_LENGTH`, body being everything above (§4.1, §4.2).
    pub mac: [u8; MAC_LENGTH],
}

impl Commit {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.h2)?;
        self.zid.marshal(writer)?;
        writer.write_all(&self.hash.tag())?;
        writer.write_all(&self.cipher.tag())?;
        writer.write_all(&self.auth_tag.tag())?;
        writer.write_all(&self.key_agreement.tag())?;
        writer.write_all(&self.sas.tag())?;
        match &self.variant {
            CommitVariant::Dh { hvi } => {
                writer.write_u8(0)?;
                writer.write_all(hvi)?;
            }
            CommitVariant::DhKem { hvi, kem_public } => {
                writer.write_u8(1)?;
                writer.write_all(hvi)?;
                writer.write_u16::<BigEndian>(kem_public.len() as u16)?;
                writer.write_all(kem_public)?;
            }
            CommitVariant::MultiOrPreshared { nonce, key_id } => {
                writer.write_u8(2)?;
                writer.write_all(nonce)?;
                match key_id {
                    Some(id) => {
                        writer.write_u8(1)?;
                        writer.write_all(id)?;
                    }
                    None => writer.write_u8(0)?,
                }
            }
        }
        writer.write_all(&self.mac)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let h2 = read_array(reader)?;
        let zid = Zid::unmarshal(reader)?;
        let hash = HashAlgo::from(read_array::<_, 4>(reader)?);
        let cipher = CipherAlgo::from(read_array::<_, 4>(reader)?);
        let auth_tag = AuthTagAlgo::from(read_array::<_, 4>(reader)?);
        let key_agreement = KeyAgreementAlgo::from(read_array::<_, 4>(reader)?);
        let sas = SasAlgo::from(read_array::<_, 4>(reader)?);

        let variant_tag = reader.read_u8()?;
        let variant = match variant_tag {
            0 => CommitVariant::Dh {
                hvi: read_array(reader)?,
            },
            1 => {
                let hvi = read_array(reader)?;
                let len = reader.read_u16::<BigEndian>()? as usize;
                let kem_public = read_exact_vec(reader, len)?;
                CommitVariant::DhKem { hvi, kem_public }
            }
            2 => {
                let nonce = read_array(reader)?;
                let has_key_id = reader.read_u8()? != 0;
                let key_id = if has_key_id {
                    Some(read_array(reader)?)
                } else {
                    None
                };
                CommitVariant::MultiOrPreshared { nonce, key_id }
            }
            _ => return Err(Error::InvalidPacket("unknown Commit variant tag")),
        };

        let mac = read_array(reader)?;

        Ok(Commit {
            h2,
            zid,
            hash,
            cipher,
            auth_tag,
            key_agreement,
            sas,
            variant,
            mac,
        })
    }

    /// The big-endian-compared value used for commit contention (§4.5): the hvi for DH-family
    /// commits, the nonce for Multi/Preshared.
    pub fn contention_value(&self) -> Vec<u8> {
        match &self.variant {
            CommitVariant::Dh { hvi } => hvi.to_vec(),
            CommitVariant::DhKem { hvi, .. } => hvi.to_vec(),
            CommitVariant::MultiOrPreshared { nonce, .. } => nonce.to_vec(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DhPart {
    pub h1: [u8; H_IMAGE_LENGTH],
    pub rs1_id: [u8; 8],
    pub rs2_id: [u8; 8],
    pub auxsecret_id: [u8; 8],
    pub pbxsecret_id: [u8; 8],
    pub public_value: Vec<u8>,
    pub mac: [u8; MAC_LENGTH],
}

impl DhPart {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.h1)?;
        writer.write_all(&self.rs1_id)?;
        writer.write_all(&self.rs2_id)?;
        writer.write_all(&self.auxsecret_id)?;
        writer.write_all(&self.pbxsecret_id)?;
        writer.write_u16::<BigEndian>(self.public_value.len() as u16)?;
        writer.write_all(&self.public_value)?;
        writer.write_all(&self.mac)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let h1 = read_array(reader)?;
        let rs1_id = read_array(reader)?;
        let rs2_id = read_array(reader)?;
        let auxsecret_id = read_array(reader)?;
        let pbxsecret_id = read_array(reader)?;
        let len = reader.read_u16::<BigEndian>()? as usize;
        let public_value = read_exact_vec(reader, len)?;
        let mac = read_array(reader)?;
        Ok(DhPart {
            h1,
            rs1_id,
            rs2_id,
            auxsecret_id,
            pbxsecret_id,
            public_value,
            mac,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfirmPlainFlags {
    pub e: bool,
    pub v: bool,
    pub a: bool,
    pub d: bool,
}

impl ConfirmPlainFlags {
    fn to_byte(&self) -> u8 {
        (self.e as u8) | ((self.v as u8) << 1) | ((self.a as u8) << 2) | ((self.d as u8) << 3)
    }

    fn from_byte(b: u8) -> Self {
        ConfirmPlainFlags {
            e: b & 0x01 != 0,
            v: b & 0x02 != 0,
            a: b & 0x04 != 0,
            d: b & 0x08 != 0,
        }
    }
}

/// The plaintext carried inside a Confirm message's encrypted block.
#[derive(Clone, Debug)]
pub struct ConfirmPlain {
    pub h0: [u8; H_IMAGE_LENGTH],
    pub flags: ConfirmPlainFlags,
    pub cache_expiration: u32,
    pub signature: Option<Vec<u8>>,
}

impl ConfirmPlain {
    fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.h0)?;
        let sig_len = self.signature.as_ref().map(|s| s.len()).unwrap_or(0);
        writer.write_u16::<BigEndian>(sig_len as u16)?;
        writer.write_u8(self.flags.to_byte())?;
        writer.write_u32::<BigEndian>(self.cache_expiration)?;
        if let Some(sig) = &self.signature {
            writer.write_all(sig)?;
        }
        Ok(())
    }

    fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let h0 = read_array(reader)?;
        let sig_len = reader.read_u16::<BigEndian>()? as usize;
        let flags = ConfirmPlainFlags::from_byte(reader.read_u8()?);
        let cache_expiration = reader.read_u32::<BigEndian>()?;
        let signature = if sig_len > 0 {
            Some(read_exact_vec(reader, sig_len)?)
        } else {
            None
        };
        Ok(ConfirmPlain {
            h0,
            flags,
            cache_expiration,
            signature,
        })
    }
}

/// The on-wire Confirm message: a MAC over the ciphertext, the CFB IV, then the ciphertext
/// itself. The codec never holds a plaintext `ConfirmPlain` and a `Confirm` at the same time
/// outside of `build_confirm`/`open_confirm`, which zeroise the plaintext buffer after use.
#[derive(Clone, Debug)]
pub struct Confirm {
    pub confirm_mac: [u8; MAC_LENGTH],
    pub cfb_iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Confirm {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.confirm_mac)?;
        writer.write_u8(self.cfb_iv.len() as u8)?;
        writer.write_all(&self.cfb_iv)?;
        writer.write_u16::<BigEndian>(self.ciphertext.len() as u16)?;
        writer.write_all(&self.ciphertext)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let confirm_mac = read_array(reader)?;
        let iv_len = reader.read_u8()? as usize;
        let cfb_iv = read_exact_vec(reader, iv_len)?;
        let ct_len = reader.read_u16::<BigEndian>()? as usize;
        let ciphertext = read_exact_vec(reader, ct_len)?;
        Ok(Confirm {
            confirm_mac,
            cfb_iv,
            ciphertext,
        })
    }
}

/// Encrypt `plain` under `cipher`/`zrtp_key`/`iv`, then compute the leading confirm-MAC over
/// the resulting ciphertext keyed by `mackey` (§4.1: "encrypts Confirm's body ... computes the
/// leading confirm-MAC over the ciphertext").
pub fn build_confirm(
    cipher: &dyn Cipher,
    hmac: &dyn Hmac,
    zrtp_key: &[u8],
    mackey: &[u8],
    iv: Vec<u8>,
    mut plain: ConfirmPlain,
) -> Result<Confirm> {
    let mut plaintext = Vec::new();
    plain.marshal(&mut plaintext)?;
    let ciphertext = cipher.encrypt(zrtp_key, &iv, &plaintext)?;
    crate::crypto::wipe(&mut plaintext);
    zeroize_confirm_plain(&mut plain);

    let full_mac = hmac.mac(mackey, &ciphertext)?;
    let mut confirm_mac = [0u8; MAC_LENGTH];
    confirm_mac.copy_from_slice(&full_mac[..MAC_LENGTH]);

    Ok(Confirm {
        confirm_mac,
        cfb_iv: iv,
        ciphertext,
    })
}

/// Verify the confirm-MAC, then decrypt to recover the plaintext block (§4.2: "verify the
/// confirm-MAC and decrypt").
pub fn open_confirm(
    cipher: &dyn Cipher,
    hmac: &dyn Hmac,
    zrtp_key: &[u8],
    mackey: &[u8],
    wire: &Confirm,
) -> Result<ConfirmPlain> {
    let full_mac = hmac.mac(mackey, &wire.ciphertext)?;
    if full_mac[..MAC_LENGTH].ct_eq(&wire.confirm_mac[..]).unwrap_u8() == 0 {
        return Err(Error::UnmatchingConfirmMac);
    }
    let mut plaintext = cipher.decrypt(zrtp_key, &wire.cfb_iv, &wire.ciphertext)?;
    let mut cursor = std::io::Cursor::new(&plaintext);
    let plain = ConfirmPlain::unmarshal(&mut cursor)?;
    crate::crypto::wipe(&mut plaintext);
    Ok(plain)
}

fn zeroize_confirm_plain(plain: &mut ConfirmPlain) {
    crate::crypto::wipe(&mut plain.h0);
    if let Some(sig) = plain.signature.as_mut() {
        crate::crypto::wipe(sig);
    }
}

#[derive(Clone, Debug)]
pub struct Conf2Ack;

impl Conf2Ack {
    pub fn marshal<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    pub fn unmarshal<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(Conf2Ack)
    }
}

#[derive(Clone, Debug)]
pub struct ZrtpError {
    pub code: u32,
}

impl ZrtpError {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.code)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(ZrtpError {
            code: reader.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ErrorAck;

impl ErrorAck {
    pub fn marshal<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    pub fn unmarshal<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(ErrorAck)
    }
}

#[derive(Clone, Debug)]
pub struct Ping {
    pub version: [u8; 4],
    pub endpoint_hash: [u8; 8],
}

impl Ping {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.version)?;
        writer.write_all(&self.endpoint_hash)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Ping {
            version: read_array(reader)?,
            endpoint_hash: read_array(reader)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PingAck {
    pub version: [u8; 4],
    pub sender_endpoint_hash: [u8; 8],
    pub received_endpoint_hash: [u8; 8],
    pub sender_ssrc: u32,
}

impl PingAck {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.version)?;
        writer.write_all(&self.sender_endpoint_hash)?;
        writer.write_all(&self.received_endpoint_hash)?;
        writer.write_u32::<BigEndian>(self.sender_ssrc)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(PingAck {
            version: read_array(reader)?,
            sender_endpoint_hash: read_array(reader)?,
            received_endpoint_hash: read_array(reader)?,
            sender_ssrc: reader.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct GoClear {
    pub clear_mac: [u8; MAC_LENGTH],
}

impl GoClear {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.clear_mac)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(GoClear {
            clear_mac: read_array(reader)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ClearAck;

impl ClearAck {
    pub fn marshal<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    pub fn unmarshal<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(ClearAck)
    }
}

#[derive(Clone, Debug)]
pub struct SasRelay {
    pub confirm_mac: [u8; MAC_LENGTH],
    pub cfb_iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SasRelay {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.confirm_mac)?;
        writer.write_u8(self.cfb_iv.len() as u8)?;
        writer.write_all(&self.cfb_iv)?;
        writer.write_u16::<BigEndian>(self.ciphertext.len() as u16)?;
        writer.write_all(&self.ciphertext)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let confirm_mac = read_array(reader)?;
        let iv_len = reader.read_u8()? as usize;
        let cfb_iv = read_exact_vec(reader, iv_len)?;
        let ct_len = reader.read_u16::<BigEndian>()? as usize;
        let ciphertext = read_exact_vec(reader, ct_len)?;
        Ok(SasRelay {
            confirm_mac,
            cfb_iv,
            ciphertext,
        })
    }
}

/// One parsed ZRTP message, tagged by its 8-byte ASCII message type (§4.1).
#[derive(Clone, Debug)]
pub enum Message {
    Hello(Hello),
    HelloAck(HelloAck),
    Commit(Commit),
    DhPart1(DhPart),
    DhPart2(DhPart),
    Confirm1(Confirm),
    Confirm2(Confirm),
    Conf2Ack(Conf2Ack),
    Error(ZrtpError),
    ErrorAck(ErrorAck),
    Ping(Ping),
    PingAck(PingAck),
    SasRelay(SasRelay),
    GoClear(GoClear),
    ClearAck(ClearAck),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Hello(_) => TAG_HELLO,
            Message::HelloAck(_) => TAG_HELLO_ACK,
            Message::Commit(_) => TAG_COMMIT,
            Message::DhPart1(_) => TAG_DH_PART1,
            Message::DhPart2(_) => TAG_DH_PART2,
            Message::Confirm1(_) => TAG_CONFIRM1,
            Message::Confirm2(_) => TAG_CONFIRM2,
            Message::Conf2Ack(_) => TAG_CONF2_ACK,
            Message::Error(_) => TAG_ERROR,
            Message::ErrorAck(_) => TAG_ERROR_ACK,
            Message::Ping(_) => TAG_PING,
            Message::PingAck(_) => TAG_PING_ACK,
            Message::SasRelay(_) => TAG_SAS_RELAY,
            Message::GoClear(_) => TAG_GO_CLEAR,
            Message::ClearAck(_) => TAG_CLEAR_ACK,
        }
    }

    /// Write the length-prefixed message (preamble + 32-bit-word length + tag + body) into
    /// `writer`, returning nothing — the caller (codec::mod) wraps this with the packet header
    /// and trailing CRC.
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        match self {
            Message::Hello(m) => m.marshal(&mut body)?,
            Message::HelloAck(m) => m.marshal(&mut body)?,
            Message::Commit(m) => m.marshal(&mut body)?,
            Message::DhPart1(m) => m.marshal(&mut body)?,
            Message::DhPart2(m) => m.marshal(&mut body)?,
            Message::Confirm1(m) => m.marshal(&mut body)?,
            Message::Confirm2(m) => m.marshal(&mut body)?,
            Message::Conf2Ack(m) => m.marshal(&mut body)?,
            Message::Error(m) => m.marshal(&mut body)?,
            Message::ErrorAck(m) => m.marshal(&mut body)?,
            Message::Ping(m) => m.marshal(&mut body)?,
            Message::PingAck(m) => m.marshal(&mut body)?,
            Message::SasRelay(m) => m.marshal(&mut body)?,
            Message::GoClear(m) => m.marshal(&mut body)?,
            Message::ClearAck(m) => m.marshal(&mut body)?,
        }

        let tag = self.tag();
        let length_words = (2 + tag.len() + body.len() + 2).div_ceil_words();

        writer.write_u16::<BigEndian>(MESSAGE_PREAMBLE)?;
        writer.write_u16::<BigEndian>(length_words as u16)?;
        writer.write_all(&tag)?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let preamble = reader.read_u16::<BigEndian>()?;
        if preamble != MESSAGE_PREAMBLE {
            return Err(Error::InvalidPacket("bad message preamble"));
        }
        let _length_words = reader.read_u16::<BigEndian>()?;
        let tag: Tag = read_array(reader)?;

        Ok(match tag {
            TAG_HELLO => Message::Hello(Hello::unmarshal(reader)?),
            TAG_HELLO_ACK => Message::HelloAck(HelloAck::unmarshal(reader)?),
            TAG_COMMIT => Message::Commit(Commit::unmarshal(reader)?),
            TAG_DH_PART1 => Message::DhPart1(DhPart::unmarshal(reader)?),
            TAG_DH_PART2 => Message::DhPart2(DhPart::unmarshal(reader)?),
            TAG_CONFIRM1 => Message::Confirm1(Confirm::unmarshal(reader)?),
            TAG_CONFIRM2 => Message::Confirm2(Confirm::unmarshal(reader)?),
            TAG_CONF2_ACK => Message::Conf2Ack(Conf2Ack::unmarshal(reader)?),
            TAG_ERROR => Message::Error(ZrtpError::unmarshal(reader)?),
            TAG_ERROR_ACK => Message::ErrorAck(ErrorAck::unmarshal(reader)?),
            TAG_PING => Message::Ping(Ping::unmarshal(reader)?),
            TAG_PING_ACK => Message::PingAck(PingAck::unmarshal(reader)?),
            TAG_SAS_RELAY => Message::SasRelay(SasRelay::unmarshal(reader)?),
            TAG_GO_CLEAR => Message::GoClear(GoClear::unmarshal(reader)?),
            TAG_CLEAR_ACK => Message::ClearAck(ClearAck::unmarshal(reader)?),
            _ => return Err(Error::InvalidPacket("unknown message tag")),
        })
    }
}

trait DivCeilWords {
    fn div_ceil_words(self) -> usize;
}

impl DivCeilWords for usize {
    fn div_ceil_words(self) -> usize {
        (self + 3) / 4
    }
}

#[cfg(test)]
mod message_test {
    use super::*;

    fn sample_hello() -> Hello {
        Hello {
            version: *b"1.10",
            client_id: *b"zrtp-core-test  ",
            h3: [7u8; H_IMAGE_LENGTH],
            zid: Zid::random(),
            flags: HelloFlags::default(),
            hash: vec![HashAlgo::Sha256],
            cipher: vec![CipherAlgo::Aes1Cfb],
            auth_tag: vec![AuthTagAlgo::HmacSha132],
            key_agreement: vec![KeyAgreementAlgo::Dh3072],
            sas: vec![SasAlgo::Base32],
            mac: [9u8; MAC_LENGTH],
        }
    }

    #[test]
    fn hello_round_trips() {
        let hello = sample_hello();
        let mut buf = Vec::new();
        hello.marshal(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(&buf);
        let parsed = Hello::unmarshal(&mut cursor).unwrap();
        assert_eq!(parsed.zid, hello.zid);
        assert_eq!(parsed.hash, hello.hash);
        assert_eq!(parsed.mac, hello.mac);
    }

    #[test]
    fn message_round_trips_through_tag_dispatch() {
        let hello = sample_hello();
        let msg = Message::Hello(hello);
        let mut buf = Vec::new();
        msg.marshal(&mut buf).unwrap();

        let mut cursor = std::io::Cursor::new(&buf);
        let parsed = Message::unmarshal(&mut cursor).unwrap();
        assert!(matches!(parsed, Message::Hello(_)));
    }

    #[test]
    fn commit_dh_round_trips() {
        let commit = Commit {
            h2: [1u8; H_IMAGE_LENGTH],
            zid: Zid::random(),
            hash: HashAlgo::Sha256,
            cipher: CipherAlgo::Aes1Cfb,
            auth_tag: AuthTagAlgo::HmacSha132,
            key_agreement: KeyAgreementAlgo::Dh3072,
            sas: SasAlgo::Base32,
            variant: CommitVariant::Dh {
                hvi: [2u8; H_IMAGE_LENGTH],
            },
            mac: [3u8; MAC_LENGTH],
        };
        let mut buf = Vec::new();
        commit.marshal(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(&buf);
        let parsed = Commit::unmarshal(&mut cursor).unwrap();
        assert_eq!(parsed.contention_value(), commit.contention_value());
    }
}
