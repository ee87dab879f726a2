//! Session coordinator (§5): owns the self ZID, the shared ZID-cache handle, and the set of
//! channels multiplexed over one peer relationship. Channel 0 runs the full DH exchange and
//! derives `ZRTPSess`; once it reaches `secure`, later channels add `ZRTPSess` and may run
//! Multistream instead of repeating the DH exchange.
//!
//! Grounded in the shape of the lineage's `conn::DTLSConn` (one connection object fanning
//! actions out to callbacks) with the `tokio`/`mpsc` reader-writer-loop machinery stripped: this
//! engine is host-driven and single-threaded per §5, so `Session` has no task of its own.

use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::channel::{Action, Channel, ChannelState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::secrets::ZidCache;
use crate::zid::Zid;

/// Shared, mutex-guarded cache handle (§5.1): the core locks it, calls the trait method, unlocks,
/// never spawning a thread of its own to do so.
pub type SharedZidCache = Arc<Mutex<dyn ZidCache>>;

struct ChannelSlot {
    channel: Channel,
    next_timer_due_ms: Option<u64>,
}

/// One peer relationship. Create with [`Session::new`], add channel 0 with [`Session::channel_add`],
/// then drive it with [`Session::channel_start`], [`Session::channel_deliver`] and
/// [`Session::session_tick`].
pub struct Session<H: Host> {
    self_zid: Zid,
    config: Config,
    cache: SharedZidCache,
    host: H,
    channels: Vec<ChannelSlot>,
    zrtp_sess: Option<Zeroizing<Vec<u8>>>,
    /// The most recent `now_ms` seen via `session_tick`, used as the baseline when an `ArmTimer`
    /// is produced outside of a tick (e.g. from `channel_start`/`channel_deliver`). The host is
    /// expected to call `session_tick` often enough that this stays a reasonable approximation
    /// of "now".
    last_now_ms: u64,
}

impl<H: Host> Session<H> {
    /// `self_zid_optional`: pass `None` to have the session generate a random ZID (§6), as a
    /// real endpoint does the first time it runs with no persisted identity.
    pub fn new(
        self_zid: Option<Zid>,
        cache: SharedZidCache,
        host: H,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Session {
            self_zid: self_zid.unwrap_or_else(Zid::random),
            config,
            cache,
            host,
            channels: Vec::new(),
            zrtp_sess: None,
            last_now_ms: 0,
        })
    }

    pub fn self_zid(&self) -> Zid {
        self.self_zid
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Channel 0 must be added before any other (§6 `channel_add`); `channel_tag` is an
    /// opaque host-chosen identifier echoed back on every `Host` callback for this channel.
    pub fn channel_add(&mut self, channel_tag: Vec<u8>, self_ssrc: u32) -> Result<usize> {
        if self.channels.len() >= self.config.max_channels {
            return Err(Error::TooManyChannels(self.config.max_channels));
        }
        let id = self.channels.len();
        let is_first_channel = id == 0;
        let mut channel = Channel::new(
            id,
            channel_tag,
            self.self_zid,
            self_ssrc,
            self.config.clone(),
            is_first_channel,
        );
        if !is_first_channel {
            if self.channels.is_empty() {
                return Err(Error::NoMainChannel);
            }
            if let Some(sess) = &self.zrtp_sess {
                channel.adopt_zrtp_sess(sess.clone());
            }
        }
        self.channels.push(ChannelSlot {
            channel,
            next_timer_due_ms: None,
        });
        Ok(id)
    }

    /// Emits `Event::Init` on `discovery_init`, sending the channel's first Hello.
    pub fn channel_start(&mut self, channel_id: usize) -> Result<()> {
        if channel_id != 0 && !self.main_channel_secure() {
            return Err(Error::NoMainChannel);
        }
        let actions = self.slot_mut(channel_id)?.channel.start()?;
        self.dispatch(channel_id, actions)
    }

    pub fn channel_deliver(&mut self, channel_id: usize, bytes: &[u8]) -> Result<()> {
        let cache_handle = self.cache.clone();
        let actions = {
            let mut cache = cache_handle.lock().expect("ZID cache mutex poisoned");
            let slot = self.slot_mut(channel_id)?;
            slot.channel.deliver(bytes, &mut *cache)?
        };
        self.dispatch(channel_id, actions)
    }

    /// Drives every channel's retransmission timer whose deadline has passed.
    pub fn session_tick(&mut self, now_ms: u64) -> Result<()> {
        self.last_now_ms = now_ms;
        for channel_id in 0..self.channels.len() {
            let due = self.channels[channel_id].next_timer_due_ms;
            if due.map(|due| now_ms >= due).unwrap_or(false) {
                let actions = self.channels[channel_id].channel.tick(now_ms)?;
                self.dispatch(channel_id, actions)?;
            }
        }
        Ok(())
    }

    #[cfg(feature = "goclear")]
    pub fn channel_user_request_goclear(&mut self, channel_id: usize) -> Result<()> {
        let _ = self.slot_mut(channel_id)?;
        Ok(())
    }

    #[cfg(feature = "goclear")]
    pub fn channel_user_accept_goclear(&mut self, channel_id: usize) -> Result<()> {
        let _ = self.slot_mut(channel_id)?;
        Ok(())
    }

    pub fn channel_state(&self, channel_id: usize) -> Result<&ChannelState> {
        Ok(&self.channel_ref(channel_id)?.state)
    }

    fn main_channel_secure(&self) -> bool {
        self.channels
            .first()
            .map(|slot| matches!(slot.channel.state, ChannelState::Secure))
            .unwrap_or(false)
    }

    fn slot_mut(&mut self, channel_id: usize) -> Result<&mut ChannelSlot> {
        self.channels
            .get_mut(channel_id)
            .ok_or(Error::UnknownChannel(channel_id))
    }

    fn channel_ref(&self, channel_id: usize) -> Result<&Channel> {
        self.channels
            .get(channel_id)
            .map(|slot| &slot.channel)
            .ok_or(Error::UnknownChannel(channel_id))
    }

    /// Interpret one batch of `Action`s: forward sends/secrets/status to the `Host`, track the
    /// channel's next retransmission deadline, and — the first time channel 0 derives it — fan
    /// `ZRTPSess` out to every channel added so far.
    fn dispatch(&mut self, channel_id: usize, actions: Vec<Action>) -> Result<()> {
        let tag = self.channel_ref(channel_id)?.tag.clone();
        for action in actions {
            match action {
                Action::Send(bytes) => self.host.send(&tag, &bytes),
                Action::ArmTimer { interval_ms } => {
                    let due = self.last_now_ms + interval_ms;
                    self.slot_mut(channel_id)?.next_timer_due_ms = Some(due);
                }
                Action::DisarmTimer => {
                    self.slot_mut(channel_id)?.next_timer_due_ms = None;
                }
                Action::SecretsAvailable(secrets) => {
                    self.host.srtp_secrets_available(&tag, &secrets);
                }
                Action::StartSrtp { sas, sas_verified } => {
                    log::info!(
                        "channel {} secure, sas={} verified={}",
                        channel_id,
                        sas,
                        sas_verified
                    );
                    self.host.start_srtp(&tag, &sas, sas_verified);
                }
                Action::Status { severity, code } => {
                    self.host.status_message(&tag, severity, code);
                }
                Action::StoreCache { peer_zid, row } => {
                    let mut cache = self
                        .cache
                        .lock()
                        .map_err(|_| Error::InvalidContext("ZID cache mutex poisoned"))?;
                    cache.store(&peer_zid, &row)?;
                }
            }
        }

        if channel_id == 0 && self.zrtp_sess.is_none() {
            if let Some(sess) = self.channels[0].channel.shared_zrtp_sess() {
                let sess = Zeroizing::new(sess.to_vec());
                for slot in self.channels.iter_mut().skip(1) {
                    slot.channel.adopt_zrtp_sess(sess.clone());
                }
                self.zrtp_sess = Some(sess);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod session_test {
    use super::*;
    use crate::host::host_test::{MemCache, RecordingHost};

    fn new_session() -> Session<RecordingHost> {
        let cache: SharedZidCache = Arc::new(Mutex::new(MemCache::default()));
        Session::new(None, cache, RecordingHost::default(), Config::default()).unwrap()
    }

    #[test]
    fn first_channel_must_be_zero() {
        let mut session = new_session();
        let id = session.channel_add(b"audio".to_vec(), 1).unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn starting_non_main_channel_before_secure_fails() {
        let mut session = new_session();
        session.channel_add(b"audio".to_vec(), 1).unwrap();
        session.channel_add(b"video".to_vec(), 2).unwrap();
        assert!(session.channel_start(1).is_err());
    }

    #[test]
    fn channel_start_sends_hello_to_host() {
        let mut session = new_session();
        session.channel_add(b"audio".to_vec(), 1).unwrap();
        session.channel_start(0).unwrap();
        assert!(!session.host_mut().sent.is_empty());
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let mut session = new_session();
        assert!(matches!(
            session.channel_start(0),
            Err(Error::UnknownChannel(0))
        ));
    }

    #[test]
    fn too_many_channels_is_rejected() {
        let mut session = Session::new(
            None,
            Arc::new(Mutex::new(MemCache::default())),
            RecordingHost::default(),
            Config {
                max_channels: 1,
                ..Config::default()
            },
        )
        .unwrap();
        session.channel_add(b"audio".to_vec(), 1).unwrap();
        assert!(matches!(
            session.channel_add(b"video".to_vec(), 2),
            Err(Error::TooManyChannels(1))
        ));
    }

    #[test]
    fn two_sessions_reach_secure_over_an_in_memory_relay() {
        let mut alice = new_session();
        let mut bob = new_session();
        alice.channel_add(b"audio".to_vec(), 1).unwrap();
        bob.channel_add(b"audio".to_vec(), 2).unwrap();

        alice.channel_start(0).unwrap();
        let mut to_bob: Vec<Vec<u8>> = std::mem::take(&mut alice.host_mut().sent)
            .into_iter()
            .map(|(_, bytes)| bytes)
            .collect();
        let mut to_alice: Vec<Vec<u8>> = Vec::new();

        for _ in 0..12 {
            for packet in to_bob.drain(..) {
                bob.channel_deliver(0, &packet).unwrap();
            }
            to_alice.extend(
                std::mem::take(&mut bob.host_mut().sent)
                    .into_iter()
                    .map(|(_, bytes)| bytes),
            );

            for packet in to_alice.drain(..) {
                alice.channel_deliver(0, &packet).unwrap();
            }
            to_bob.extend(
                std::mem::take(&mut alice.host_mut().sent)
                    .into_iter()
                    .map(|(_, bytes)| bytes),
            );

            if matches!(alice.channel_state(0).unwrap(), ChannelState::Secure)
                && matches!(bob.channel_state(0).unwrap(), ChannelState::Secure)
            {
                break;
            }
        }

        assert!(matches!(alice.channel_state(0).unwrap(), ChannelState::Secure));
        assert!(matches!(bob.channel_state(0).unwrap(), ChannelState::Secure));
        assert!(!alice.host_mut().started.is_empty());
        assert!(!bob.host_mut().started.is_empty());
    }
}
