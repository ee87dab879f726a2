//! Cached-secrets layer (§4.6): the ZID-cache row for a peer, and the cached-secret IDs placed
//! on the wire so each side can tell the other which of its own secrets it holds.

use rand::RngCore;

use crate::crypto::Hmac;
use crate::error::Result;
use crate::zid::Zid;

pub const SECRET_ID_LEN: usize = 8;

/// One row of persisted state, keyed by peer ZID (§6 "Persisted state").
#[derive(Clone, Default)]
pub struct CachedQuadruple {
    pub rs1: Option<Vec<u8>>,
    pub rs2: Option<Vec<u8>>,
    pub auxsecret: Option<Vec<u8>>,
    pub pbxsecret: Option<Vec<u8>>,
    pub previously_verified_sas: bool,
    pub last_update: u64,
}

/// Host-provided, mutex-guarded key/value store, keyed by peer ZID (§5, §6). The core never
/// persists to disk itself; it only reads and writes through this trait.
pub trait ZidCache: Send {
    fn load(&mut self, peer_zid: &Zid) -> Result<CachedQuadruple>;
    fn store(&mut self, peer_zid: &Zid, row: &CachedQuadruple) -> Result<()>;
}

/// The two 8-byte truncated HMAC IDs computed for one secret (§4.6): `initiatorID =
/// HMAC(secret, "Initiator")`, `responderID = HMAC(secret, "Responder")`, each truncated to 64
/// bits. When the secret is absent, both IDs are drawn at random so the wire can't distinguish
/// "we don't hold this secret" from "we hold it but picked an ID that happens to mismatch."
pub struct SecretIds {
    pub initiator_id: [u8; SECRET_ID_LEN],
    pub responder_id: [u8; SECRET_ID_LEN],
}

fn truncate8(full: &[u8]) -> [u8; SECRET_ID_LEN] {
    let mut out = [0u8; SECRET_ID_LEN];
    out.copy_from_slice(&full[..SECRET_ID_LEN]);
    out
}

pub fn compute_secret_ids(hmac: &dyn Hmac, secret: Option<&[u8]>) -> Result<SecretIds> {
    match secret {
        Some(secret) => Ok(SecretIds {
            initiator_id: truncate8(&hmac.mac(secret, b"Initiator")?),
            responder_id: truncate8(&hmac.mac(secret, b"Responder")?),
        }),
        None => {
            let mut initiator_id = [0u8; SECRET_ID_LEN];
            let mut responder_id = [0u8; SECRET_ID_LEN];
            rand::thread_rng().fill_bytes(&mut initiator_id);
            rand::thread_rng().fill_bytes(&mut responder_id);
            Ok(SecretIds {
                initiator_id,
                responder_id,
            })
        }
    }
}

/// The auxsecret ID uses H3 as the HMAC input instead of a fixed label, because the aux secret
/// is channel-scoped rather than session-scoped: self H3 when computing our own advertised ID
/// as initiator, peer H3 when computing it as responder (§4.6).
pub fn compute_auxsecret_ids(
    hmac: &dyn Hmac,
    auxsecret: Option<&[u8]>,
    h3_initiator_role: &[u8],
    h3_responder_role: &[u8],
) -> Result<SecretIds> {
    match auxsecret {
        Some(secret) => Ok(SecretIds {
            initiator_id: truncate8(&hmac.mac(secret, h3_initiator_role)?),
            responder_id: truncate8(&hmac.mac(secret, h3_responder_role)?),
        }),
        None => compute_secret_ids(hmac, None),
    }
}

/// Which cached secret (if any) to fold into `s0` as `s1`: rs1 if held, else rs2, else absent.
pub fn select_s1<'a>(row: &'a CachedQuadruple) -> Option<&'a [u8]> {
    row.rs1.as_deref().or(row.rs2.as_deref())
}

/// Rotate rs1 forward after a successful exchange (§4.6): the freshly derived secret becomes
/// rs1, and what used to be rs1 slides down to rs2.
pub fn rotate_rs1(row: &mut CachedQuadruple, new_rs1: Vec<u8>) {
    row.rs2 = row.rs1.take();
    row.rs1 = Some(new_rs1);
}

#[cfg(test)]
mod secrets_test {
    use super::*;
    use crate::crypto::HmacSha256Adapter;

    #[test]
    fn absent_secret_still_produces_ids() {
        let hmac = HmacSha256Adapter;
        let ids = compute_secret_ids(&hmac, None).unwrap();
        assert_eq!(ids.initiator_id.len(), SECRET_ID_LEN);
    }

    #[test]
    fn present_secret_ids_are_deterministic() {
        let hmac = HmacSha256Adapter;
        let secret = b"retained-secret-bytes-32-long!!!";
        let a = compute_secret_ids(&hmac, Some(secret)).unwrap();
        let b = compute_secret_ids(&hmac, Some(secret)).unwrap();
        assert_eq!(a.initiator_id, b.initiator_id);
        assert_eq!(a.responder_id, b.responder_id);
        assert_ne!(a.initiator_id, a.responder_id);
    }

    #[test]
    fn rotate_moves_rs1_into_rs2() {
        let mut row = CachedQuadruple {
            rs1: Some(vec![1u8; 32]),
            ..Default::default()
        };
        rotate_rs1(&mut row, vec![2u8; 32]);
        assert_eq!(row.rs1, Some(vec![2u8; 32]));
        assert_eq!(row.rs2, Some(vec![1u8; 32]));
    }
}
