//! Primitive adapters: hash, HMAC, block cipher (CFB), DH/ECDH/KEM key agreement, RNG.
//!
//! The protocol engine never implements these primitives itself (explicitly out of scope);
//! it calls them through the traits below. Each trait ships exactly one illustrative concrete
//! implementation so the crate is usable out of the box, the same way the teacher's
//! `CipherSuite` trait ships concrete `CipherSuiteAes128*`/`CipherSuiteTls*` implementations
//! behind a shared interface rather than leaving callers to wire up RustCrypto crates by hand.

use aes::Aes128;
use block_modes::block_padding::NoPadding;
use block_modes::{BlockMode, Cfb};
use hmac::{Hmac as HmacImpl, Mac, NewMac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A cryptographic hash function. The engine's implicit hash (§3) is always SHA-256 regardless
/// of the negotiated `HashAlgo`; negotiable-hash operations (total_hash, KDF) take one of these
/// as a parameter instead of hard-coding SHA-256 a second time.
pub trait Hash: Send + Sync {
    fn output_len(&self) -> usize;
    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

#[derive(Default)]
pub struct Sha256Hash;

impl Hash for Sha256Hash {
    fn output_len(&self) -> usize {
        32
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

/// H(x): the fixed implicit hash used for the hash chain (§3, §4.2), independent of negotiation.
pub fn implicit_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

type HmacSha256 = HmacImpl<Sha256>;

/// HMAC keyed with arbitrary-length key material, truncated to a caller-chosen length.
pub trait Hmac: Send + Sync {
    fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct HmacSha256Adapter;

impl Hmac for HmacSha256Adapter {
    fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac =
            HmacSha256::new_varkey(key).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// A block cipher run in CFB mode, used to encrypt the Confirm message body (§4.1).
pub trait Cipher: Send + Sync {
    fn key_len(&self) -> usize;
    fn iv_len(&self) -> usize;
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

type Aes128Cfb = Cfb<Aes128, NoPadding>;

#[derive(Default)]
pub struct Aes128CfbCipher;

impl Cipher for Aes128CfbCipher {
    fn key_len(&self) -> usize {
        16
    }

    fn iv_len(&self) -> usize {
        16
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            Aes128Cfb::new_var(key, iv).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        Ok(cipher.encrypt_vec(plaintext))
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            Aes128Cfb::new_var(key, iv).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        cipher
            .decrypt_vec(ciphertext)
            .map_err(|e| Error::CryptoFailure(e.to_string()))
    }
}

/// DH/ECDH/KEM key agreement. One adapter covers one negotiated `KeyAgreementAlgo`; the engine
/// is indifferent to whether `derive_shared_secret` performs a Diffie-Hellman computation or a
/// KEM decapsulation — both produce a shared-secret byte string.
pub trait KeyAgreement: Send + Sync {
    /// Generate an ephemeral keypair, returning the public value to place on the wire.
    fn generate_keypair(&self) -> Result<(Vec<u8>, Box<dyn PrivateKey>)>;

    /// Reject values the RFC requires rejecting (the identity element / group order minus one)
    /// before they are ever used to derive a shared secret (§9.1 resolved open question #2).
    fn validate_peer_public_value(&self, peer_public: &[u8]) -> Result<()>;

    fn derive_shared_secret(&self, private: &dyn PrivateKey, peer_public: &[u8]) -> Result<Vec<u8>>;
}

pub trait PrivateKey: Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;
}

pub struct X25519KeyAgreement;

struct X25519PrivateKey(x25519_dalek::StaticSecret);

impl PrivateKey for X25519PrivateKey {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl KeyAgreement for X25519KeyAgreement {
    fn generate_keypair(&self) -> Result<(Vec<u8>, Box<dyn PrivateKey>)> {
        let secret = x25519_dalek::StaticSecret::new(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok((
            public.as_bytes().to_vec(),
            Box::new(X25519PrivateKey(secret)),
        ))
    }

    fn validate_peer_public_value(&self, peer_public: &[u8]) -> Result<()> {
        if peer_public.len() != 32 {
            return Err(Error::CryptoFailure(
                "X25519 public value has wrong length".into(),
            ));
        }
        // Reject the identity element and the order-2 low point: both collapse the shared
        // secret to a known constant regardless of our private scalar.
        if peer_public.iter().all(|&b| b == 0) {
            return Err(Error::CryptoFailure(
                "X25519 public value is the identity element".into(),
            ));
        }
        let all_but_last_zero = peer_public[..31].iter().all(|&b| b == 0);
        if all_but_last_zero && peer_public[31] == 0x80 {
            return Err(Error::CryptoFailure(
                "X25519 public value is a known low-order point".into(),
            ));
        }
        Ok(())
    }

    fn derive_shared_secret(&self, private: &dyn PrivateKey, peer_public: &[u8]) -> Result<Vec<u8>> {
        self.validate_peer_public_value(peer_public)?;
        let secret = private
            .as_any()
            .downcast_ref::<X25519PrivateKey>()
            .ok_or_else(|| Error::InvalidContext("private key does not match X25519 adapter"))?;
        let mut peer_bytes = [0u8; 32];
        peer_bytes.copy_from_slice(peer_public);
        let peer_public = x25519_dalek::PublicKey::from(peer_bytes);
        let shared = secret.0.diffie_hellman(&peer_public);
        Ok(shared.as_bytes().to_vec())
    }
}

/// Overwrite a plaintext buffer after use (§4.7: "All temporary plaintext buffers are zeroised
/// after use"). Kept as a thin wrapper so call sites read as a deliberate step rather than an
/// incidental `zeroize::Zeroize` import.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod crypto_test {
    use super::*;

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 1.
        let key = [0x0bu8; 20];
        let data = b"Hi There";
        let mac = HmacSha256Adapter.mac(&key, data).unwrap();
        assert_eq!(
            mac,
            hex("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff")
        );
    }

    #[test]
    fn x25519_round_trip() {
        let kx = X25519KeyAgreement;
        let (pub_a, priv_a) = kx.generate_keypair().unwrap();
        let (pub_b, priv_b) = kx.generate_keypair().unwrap();
        let shared_a = kx.derive_shared_secret(priv_a.as_ref(), &pub_b).unwrap();
        let shared_b = kx.derive_shared_secret(priv_b.as_ref(), &pub_a).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn x25519_rejects_identity_element() {
        let kx = X25519KeyAgreement;
        let zero = [0u8; 32];
        assert!(kx.validate_peer_public_value(&zero).is_err());
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }
}
