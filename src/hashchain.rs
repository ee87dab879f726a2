//! Hash-chain commitment (§4.2): H0 drawn at random, H1..H3 precomputed, revealed in reverse
//! order across Hello/Commit/DHPart/Confirm and verified one step at a time as they arrive.

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::codec::message::MAC_LENGTH;
use crate::crypto::{implicit_hash, Hmac};
use crate::error::{Error, Result};

pub const HASH_IMAGE_LEN: usize = 32;

/// The four hash-chain images for one channel: H3 = H(H2) = H(H(H1)) = H(H(H(H0))), H0 random.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HashChain {
    pub h0: [u8; HASH_IMAGE_LEN],
    pub h1: [u8; HASH_IMAGE_LEN],
    pub h2: [u8; HASH_IMAGE_LEN],
    pub h3: [u8; HASH_IMAGE_LEN],
}

impl HashChain {
    pub fn generate() -> Self {
        let mut h0 = [0u8; HASH_IMAGE_LEN];
        rand::thread_rng().fill_bytes(&mut h0);
        let h1 = implicit_hash(&h0);
        let h2 = implicit_hash(&h1);
        let h3 = implicit_hash(&h2);
        HashChain { h0, h1, h2, h3 }
    }
}

/// Verify that `revealed` hashes forward to `expected_image` (the image stored from an earlier
/// message). Any mismatch is fatal to the channel (§4.2, §8).
pub fn verify_reveal(revealed: &[u8; HASH_IMAGE_LEN], expected_image: &[u8; HASH_IMAGE_LEN]) -> Result<()> {
    let computed = implicit_hash(revealed);
    if &computed == expected_image {
        Ok(())
    } else {
        Err(Error::UnmatchingHashChain)
    }
}

/// The trailing MAC stamped on a stored Hello/Commit/DHPart (§4.1, §4.2): HMAC-SHA-256 over the
/// message body (everything but the MAC field itself), keyed by the H-image the message's own
/// sender will only reveal one message later, truncated to `MAC_LENGTH` bytes.
pub fn stored_message_mac(
    hmac: &dyn Hmac,
    key_image: &[u8; HASH_IMAGE_LEN],
    body: &[u8],
) -> Result<[u8; MAC_LENGTH]> {
    let full = hmac.mac(key_image, body)?;
    let mut mac = [0u8; MAC_LENGTH];
    mac.copy_from_slice(&full[..MAC_LENGTH]);
    Ok(mac)
}

/// Verify a previously stored message now that the H-image keying its trailing MAC has been
/// revealed by the next message in its sender's chain. `stored` is the complete marshaled
/// message (no packet header) with the real MAC as its last `MAC_LENGTH` bytes.
pub fn verify_stored_mac(hmac: &dyn Hmac, key_image: &[u8; HASH_IMAGE_LEN], stored: &[u8]) -> Result<()> {
    if stored.len() < MAC_LENGTH {
        return Err(Error::InvalidContext("stored message shorter than its own MAC field"));
    }
    let (body, mac) = stored.split_at(stored.len() - MAC_LENGTH);
    let expected = stored_message_mac(hmac, key_image, body)?;
    if expected[..].ct_eq(mac).unwrap_u8() == 0 {
        return Err(Error::UnmatchingMac);
    }
    Ok(())
}

#[cfg(test)]
mod hashchain_test {
    use super::*;

    #[test]
    fn chain_links_forward() {
        let chain = HashChain::generate();
        assert_eq!(implicit_hash(&chain.h0), chain.h1);
        assert_eq!(implicit_hash(&chain.h1), chain.h2);
        assert_eq!(implicit_hash(&chain.h2), chain.h3);
    }

    #[test]
    fn verify_reveal_accepts_correct_preimage() {
        let chain = HashChain::generate();
        assert!(verify_reveal(&chain.h0, &chain.h1).is_ok());
    }

    #[test]
    fn verify_reveal_rejects_wrong_preimage() {
        let chain = HashChain::generate();
        let other = HashChain::generate();
        assert!(verify_reveal(&other.h0, &chain.h1).is_err());
    }

    #[test]
    fn stored_mac_round_trips() {
        let hmac = crate::crypto::HmacSha256Adapter;
        let chain = HashChain::generate();
        let body = b"a stored hello body, minus its own mac field";
        let mac = stored_message_mac(&hmac, &chain.h2, body).unwrap();
        let mut stored = body.to_vec();
        stored.extend_from_slice(&mac);
        assert!(verify_stored_mac(&hmac, &chain.h2, &stored).is_ok());
    }

    #[test]
    fn stored_mac_rejects_tampered_body() {
        let hmac = crate::crypto::HmacSha256Adapter;
        let chain = HashChain::generate();
        let body = b"a stored hello body, minus its own mac field";
        let mac = stored_message_mac(&hmac, &chain.h2, body).unwrap();
        let mut stored = b"a tampered hello body, minus its own field!!!".to_vec();
        stored.extend_from_slice(&mac);
        assert!(verify_stored_mac(&hmac, &chain.h2, &stored).is_err());
    }

    #[test]
    fn stored_mac_rejects_wrong_key_image() {
        let hmac = crate::crypto::HmacSha256Adapter;
        let chain = HashChain::generate();
        let other = HashChain::generate();
        let body = b"a stored hello body, minus its own mac field";
        let mac = stored_message_mac(&hmac, &chain.h2, body).unwrap();
        let mut stored = body.to_vec();
        stored.extend_from_slice(&mac);
        assert!(verify_stored_mac(&hmac, &other.h2, &stored).is_err());
    }
}
