//! Key schedule (§4.7): total_hash, KDF, s0, ZRTPSess, mackey/zrtpkey, SRTP secrets, SAS.

use crate::crypto::{Hash, Hmac};
use crate::error::{Error, Result};
use crate::negotiation::Agreed;
use crate::zid::Zid;

pub const KDF_LABEL_RETAINED_SECRET: &str = "retained secret";
pub const KDF_LABEL_MSK: &str = "ZRTP MSK";
pub const KDF_LABEL_INITIATOR_MAC: &str = "Initiator HMAC key";
pub const KDF_LABEL_RESPONDER_MAC: &str = "Responder HMAC key";
pub const KDF_LABEL_INITIATOR_ZRTP_KEY: &str = "Initiator ZRTP key";
pub const KDF_LABEL_RESPONDER_ZRTP_KEY: &str = "Responder ZRTP key";
pub const KDF_LABEL_SESSION_KEY: &str = "ZRTP Session Key";
pub const KDF_LABEL_SAS: &str = "SAS";
pub const KDF_LABEL_SRTP_INITIATOR_KEY: &str = "Initiator SRTP master key";
pub const KDF_LABEL_SRTP_INITIATOR_SALT: &str = "Initiator SRTP master salt";
pub const KDF_LABEL_SRTP_RESPONDER_KEY: &str = "Responder SRTP master key";
pub const KDF_LABEL_SRTP_RESPONDER_SALT: &str = "Responder SRTP master salt";

const SRTP_SALT_LEN: usize = 14;

/// `total_hash` over the stored message bodies exchanged so far, in message order (§4.7).
/// For a multistream channel only `hello_responder` and `commit` are supplied.
pub fn total_hash(hash: &dyn Hash, parts: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(part);
    }
    hash.digest(&buf)
}

/// `KDF_context = ZID_i || ZID_r || total_hash`.
pub fn kdf_context(zid_initiator: &Zid, zid_responder: &Zid, total_hash: &[u8]) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(24 + total_hash.len());
    ctx.extend_from_slice(zid_initiator.as_bytes());
    ctx.extend_from_slice(zid_responder.as_bytes());
    ctx.extend_from_slice(total_hash);
    ctx
}

/// `KDF(key, label, context, L) = HMAC(key, 0x00000001 || label || 0x00 || context || L_be32)`,
/// truncated (or, for the single-block counter fixed at 1, only ever truncated — never
/// extended beyond the underlying HMAC's output) to `l` bytes.
pub fn kdf(hmac: &dyn Hmac, key: &[u8], label: &str, context: &[u8], l: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(label.as_bytes());
    data.push(0x00);
    data.extend_from_slice(context);
    data.extend_from_slice(&((l * 8) as u32).to_be_bytes());

    let mac = hmac.mac(key, &data)?;
    if l > mac.len() {
        return Err(Error::InvalidContext(
            "requested KDF output longer than one HMAC block",
        ));
    }
    Ok(mac[..l].to_vec())
}

/// One of the three cached secrets folded into `s0` (§4.7): present (with bytes) or absent
/// (contributes a zero length field and no bytes).
pub enum Secret<'a> {
    Present(&'a [u8]),
    Absent,
}

impl<'a> Secret<'a> {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Secret::Present(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Secret::Absent => {
                out.extend_from_slice(&0u32.to_be_bytes());
            }
        }
    }
}

/// `s0` for a DH-family channel: `H(0x00000001 || DHResult || "ZRTP-HMAC-KDF" || KDF_context ||
/// len(s1)||s1 || len(s2)||s2 || len(s3)||s3)`.
pub fn s0_dh(
    hash: &dyn Hash,
    dh_result: &[u8],
    kdf_context: &[u8],
    s1: &Secret<'_>,
    s2: &Secret<'_>,
    s3: &Secret<'_>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(dh_result);
    buf.extend_from_slice(b"ZRTP-HMAC-KDF");
    buf.extend_from_slice(kdf_context);
    s1.write(&mut buf);
    s2.write(&mut buf);
    s3.write(&mut buf);
    hash.digest(&buf)
}

/// `s0` for a multistream channel: `KDF(ZRTPSess, "ZRTP MSK", KDF_context, hashLength)`.
pub fn s0_multistream(
    hmac: &dyn Hmac,
    zrtp_sess: &[u8],
    kdf_context: &[u8],
    hash_len: usize,
) -> Result<Vec<u8>> {
    kdf(hmac, zrtp_sess, KDF_LABEL_MSK, kdf_context, hash_len)
}

/// The four per-channel symmetric keys derived from `s0`.
pub struct ChannelKeys {
    pub mackey_i: Vec<u8>,
    pub mackey_r: Vec<u8>,
    pub zrtpkey_i: Vec<u8>,
    pub zrtpkey_r: Vec<u8>,
}

pub fn derive_channel_keys(
    hmac: &dyn Hmac,
    s0: &[u8],
    kdf_context: &[u8],
    agreed: &Agreed,
) -> Result<ChannelKeys> {
    let hash_len = agreed.hash_len();
    let cipher_len = agreed.cipher_key_len();
    Ok(ChannelKeys {
        mackey_i: kdf(hmac, s0, KDF_LABEL_INITIATOR_MAC, kdf_context, hash_len)?,
        mackey_r: kdf(hmac, s0, KDF_LABEL_RESPONDER_MAC, kdf_context, hash_len)?,
        zrtpkey_i: kdf(hmac, s0, KDF_LABEL_INITIATOR_ZRTP_KEY, kdf_context, cipher_len)?,
        zrtpkey_r: kdf(hmac, s0, KDF_LABEL_RESPONDER_ZRTP_KEY, kdf_context, cipher_len)?,
    })
}

/// `ZRTPSess = KDF(s0, "ZRTP Session Key", KDF_context, hashLength)`, derived once on the
/// first (DH-mode) channel and reused to key subsequent multistream channels.
pub fn derive_zrtp_sess(
    hmac: &dyn Hmac,
    s0: &[u8],
    kdf_context: &[u8],
    hash_len: usize,
) -> Result<Vec<u8>> {
    kdf(hmac, s0, KDF_LABEL_SESSION_KEY, kdf_context, hash_len)
}

/// The SRTP key/salt quadruple handed to the host via `srtp_secrets_available` (§4.7.1).
#[derive(Clone)]
pub struct SrtpSecrets {
    pub initiator_key: Vec<u8>,
    pub initiator_salt: Vec<u8>,
    pub responder_key: Vec<u8>,
    pub responder_salt: Vec<u8>,
}

pub fn derive_srtp_secrets(
    hmac: &dyn Hmac,
    s0: &[u8],
    kdf_context: &[u8],
    agreed: &Agreed,
) -> Result<SrtpSecrets> {
    let cipher_len = agreed.cipher_key_len();
    Ok(SrtpSecrets {
        initiator_key: kdf(
            hmac,
            s0,
            KDF_LABEL_SRTP_INITIATOR_KEY,
            kdf_context,
            cipher_len,
        )?,
        initiator_salt: kdf(
            hmac,
            s0,
            KDF_LABEL_SRTP_INITIATOR_SALT,
            kdf_context,
            SRTP_SALT_LEN,
        )?,
        responder_key: kdf(
            hmac,
            s0,
            KDF_LABEL_SRTP_RESPONDER_KEY,
            kdf_context,
            cipher_len,
        )?,
        responder_salt: kdf(
            hmac,
            s0,
            KDF_LABEL_SRTP_RESPONDER_SALT,
            kdf_context,
            SRTP_SALT_LEN,
        )?,
    })
}

/// `new_rs1 = KDF(s0, "retained secret", KDF-context, 256)` (256 bits = 32 bytes, §4.6).
pub fn derive_new_rs1(hmac: &dyn Hmac, s0: &[u8], kdf_context: &[u8]) -> Result<Vec<u8>> {
    kdf(hmac, s0, KDF_LABEL_RETAINED_SECRET, kdf_context, 32)
}

/// Short Authentication String: the leading 32 bits of `sashash = KDF(s0, "SAS", KDF_context,
/// 256)`, rendered per the negotiated SAS algorithm.
pub fn derive_sas_value(hmac: &dyn Hmac, s0: &[u8], kdf_context: &[u8]) -> Result<u32> {
    let sashash = kdf(hmac, s0, KDF_LABEL_SAS, kdf_context, 32)?;
    Ok(u32::from_be_bytes([sashash[0], sashash[1], sashash[2], sashash[3]]))
}

const BASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Render a SAS value as 4 base32 characters (the ZRTP "B32" alphabet, not RFC 4648's).
pub fn render_base32(sas_value: u32) -> String {
    let mut out = String::with_capacity(4);
    for i in (0..4).rev() {
        let shift = i * 5;
        let idx = ((sas_value >> shift) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[idx] as char);
    }
    out
}

/// Render a SAS value as two PGP words, alternating the even-position and odd-position tables
/// per the PGP word list (the even table encodes the high 16 bits, the odd table the low 16).
pub fn render_pgp_words(sas_value: u32, even_table: &[&str; 256], odd_table: &[&str; 256]) -> String {
    let high = ((sas_value >> 16) & 0xff) as usize;
    let low = (sas_value & 0xff) as usize;
    format!("{} {}", even_table[high], odd_table[low])
}

#[cfg(test)]
mod keyschedule_test {
    use super::*;
    use crate::crypto::{HmacSha256Adapter, Sha256Hash};

    #[test]
    fn kdf_truncates_to_requested_length() {
        let hmac = HmacSha256Adapter;
        let out = kdf(&hmac, b"key", "label", b"ctx", 16).unwrap();
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn kdf_rejects_length_beyond_one_block() {
        let hmac = HmacSha256Adapter;
        assert!(kdf(&hmac, b"key", "label", b"ctx", 64).is_err());
    }

    #[test]
    fn s0_dh_is_deterministic() {
        let hash = Sha256Hash;
        let s1 = Secret::Present(b"rs1-secret");
        let s2 = Secret::Absent;
        let s3 = Secret::Absent;
        let a = s0_dh(&hash, b"dh-result", b"ctx", &s1, &s2, &s3);
        let b = s0_dh(&hash, b"dh-result", b"ctx", &s1, &s2, &s3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn base32_rendering_is_four_characters() {
        let s = render_base32(0xdead_beef);
        assert_eq!(s.chars().count(), 4);
    }
}
