//! The host-facing callback surface (§6): everything the engine invokes on the embedding
//! application. Mirrors how the lineage exposes `Conn`'s external behavior through plain trait
//! methods rather than a separate callback-registration API.

pub use crate::secrets::ZidCache;

use crate::channel::Severity;
use crate::keyschedule::SrtpSecrets;

/// Per-session callbacks. Object-safe so a `Session` can hold `Box<dyn Host>`.
///
/// `ZidCache` is deliberately a separate trait (see `secrets::ZidCache`): the cache handle may
/// be shared across sessions behind a `Mutex` per §5, while everything here is per-session.
pub trait Host: Send {
    /// Hand a fully built packet to the wire for `channel_tag`. Must not block.
    fn send(&mut self, channel_tag: &[u8], bytes: &[u8]);

    /// Derived SRTP keying material is ready for `channel_tag`.
    fn srtp_secrets_available(&mut self, channel_tag: &[u8], secrets: &SrtpSecrets);

    /// The channel reached `secure`; media may now flow. `sas` is the rendered Short
    /// Authentication String, `sas_verified` reflects the cached `previously_verified_sas` flag.
    fn start_srtp(&mut self, channel_tag: &[u8], sas: &str, sas_verified: bool);

    /// A non-fatal status worth surfacing to a user or operator (§7): timeouts, cache mismatches,
    /// peer-reported Errors. Never called for conditions that already produced an `Err` from
    /// `channel_deliver`/`channel_start`/`session_tick`.
    fn status_message(&mut self, channel_tag: &[u8], severity: Severity, code: &str);
}

#[cfg(test)]
pub(crate) mod host_test {
    use super::*;
    use crate::zid::Zid;
    use std::collections::HashMap;

    /// An in-memory `Host` + `ZidCache` used to wire two sessions together for the two-party
    /// harness (§8): `send` is filled in by the harness itself with a direct call into the
    /// peer's `channel_deliver`, since routing needs a handle to the *other* session.
    #[derive(Default)]
    pub struct RecordingHost {
        pub sent: Vec<(Vec<u8>, Vec<u8>)>,
        pub secrets: Vec<(Vec<u8>, SrtpSecrets)>,
        pub started: Vec<(Vec<u8>, String, bool)>,
        pub statuses: Vec<(Vec<u8>, Severity, String)>,
    }

    impl Host for RecordingHost {
        fn send(&mut self, channel_tag: &[u8], bytes: &[u8]) {
            self.sent.push((channel_tag.to_vec(), bytes.to_vec()));
        }

        fn srtp_secrets_available(&mut self, channel_tag: &[u8], secrets: &SrtpSecrets) {
            self.secrets.push((channel_tag.to_vec(), secrets.clone()));
        }

        fn start_srtp(&mut self, channel_tag: &[u8], sas: &str, sas_verified: bool) {
            self.started
                .push((channel_tag.to_vec(), sas.to_string(), sas_verified));
        }

        fn status_message(&mut self, channel_tag: &[u8], severity: Severity, code: &str) {
            self.statuses
                .push((channel_tag.to_vec(), severity, code.to_string()));
        }
    }

    #[derive(Default)]
    pub struct MemCache(pub HashMap<Zid, crate::secrets::CachedQuadruple>);

    impl ZidCache for MemCache {
        fn load(&mut self, peer_zid: &Zid) -> crate::error::Result<crate::secrets::CachedQuadruple> {
            Ok(self.0.get(peer_zid).cloned().unwrap_or_default())
        }

        fn store(
            &mut self,
            peer_zid: &Zid,
            row: &crate::secrets::CachedQuadruple,
        ) -> crate::error::Result<()> {
            self.0.insert(*peer_zid, row.clone());
            Ok(())
        }
    }
}
