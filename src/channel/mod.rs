//! Per-channel state machine (§4.4): one `Channel` tracks one ZRTP exchange (media stream) from
//! `discovery_init` through `secure`. `Channel::start`/`deliver`/`tick` are the impure shell —
//! each stamps the channel's clock/ID bookkeeping and then calls the host — wrapping the pure
//! step logic in `transition`, matching the lineage's per-state `Flight::parse`/`generate` split
//! but collapsed from "trait object per flight, async" to "tagged enum, synchronous".

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::codec::header::PacketHeader;
use crate::codec::message::*;
use crate::codec::{build_packets, parse_packet, ParsedPacket, Reassembler};
use crate::config::Config;
use crate::crypto::{implicit_hash, Cipher, Hash, Hmac, KeyAgreement, PrivateKey};
use crate::error::{Error, Result};
use crate::hashchain::{self, verify_reveal, HashChain};
use crate::keyschedule::{
    self, kdf_context, s0_dh, s0_multistream, total_hash, ChannelKeys, Secret, SrtpSecrets,
};
use crate::negotiation::{negotiate, Agreed, KeyAgreementAlgo, Menu};
use crate::secrets::{
    compute_auxsecret_ids, compute_secret_ids, rotate_rs1, select_s1, CachedQuadruple, ZidCache,
};
use crate::zid::Zid;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    DiscoveryInit,
    WaitingForHello,
    WaitingForHelloAck,
    SendingCommit,
    ResponderSendingDhPart1,
    InitiatorSendingDhPart2,
    ResponderSendingConfirm1,
    InitiatorSendingConfirm2,
    Secure,
    #[cfg(feature = "goclear")]
    SendingGoClear,
    #[cfg(feature = "goclear")]
    Clear,
    Failed,
}

pub enum Event {
    Init,
    Message(Message),
    Timer,
    #[cfg(feature = "goclear")]
    UserGoClear,
    #[cfg(feature = "goclear")]
    AcceptGoClear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

pub enum Action {
    Send(Vec<u8>),
    ArmTimer { interval_ms: u64 },
    DisarmTimer,
    SecretsAvailable(SrtpSecrets),
    StartSrtp { sas: String, sas_verified: bool },
    Status { severity: Severity, code: &'static str },
    /// Persist the rotated cached-secret row for `peer_zid` (§4.6: "the cache is updated under
    /// the session mutex"). Emitted once per successful DH exchange, from `finish_secure`.
    StoreCache { peer_zid: Zid, row: CachedQuadruple },
}

struct RetransmitState {
    packets: Vec<Vec<u8>>,
    interval_ms: u64,
    cap_ms: u64,
    tries: u32,
    max_tries: u32,
}

/// One ZRTP exchange. Channel 0 of a session runs the full DH exchange and derives `ZRTPSess`;
/// subsequent channels may run Multistream, reusing channel 0's `ZRTPSess`.
pub struct Channel {
    pub id: usize,
    pub tag: Vec<u8>,
    pub state: ChannelState,

    role: Option<Role>,
    is_first_channel: bool,

    local_zid: Zid,
    peer_zid: Option<Zid>,
    local_ssrc: u32,

    config: Config,
    local_menu: Menu,
    agreed: Option<Agreed>,

    hash: Box<dyn Hash>,
    hmac: Box<dyn Hmac>,
    cipher: Box<dyn Cipher>,
    key_agreement: Box<dyn KeyAgreement>,

    hash_chain: HashChain,
    peer_h3: Option<[u8; 32]>,
    peer_h2: Option<[u8; 32]>,
    peer_h1: Option<[u8; 32]>,

    next_sequence: u16,
    last_accepted_sequence: Option<u16>,
    next_message_id: u16,
    reassembler: Reassembler,
    retransmit: Option<RetransmitState>,

    // Stored message bodies, needed byte-exact for total_hash/hvi and for repetition checks.
    local_hello: Option<Vec<u8>>,
    peer_hello: Option<Vec<u8>>,
    local_commit: Option<Vec<u8>>,
    peer_commit: Option<Commit>,
    local_dhpart: Option<Vec<u8>>,
    peer_dhpart: Option<DhPart>,

    cached_row: Option<CachedQuadruple>,
    local_private_key: Option<Box<dyn PrivateKey>>,
    local_public_value: Option<Vec<u8>>,

    zrtp_sess: Option<Zeroizing<Vec<u8>>>,
    s0: Option<Zeroizing<Vec<u8>>>,
    keys: Option<ChannelKeys>,
}

/// Only SHA-256 is wired up as a concrete `Hash` adapter (§3); Sha384 negotiation is accepted
/// on the wire but falls back to this adapter until a second `Hash` impl is plugged in.
fn hash_for(_agreed: &Agreed) -> Box<dyn Hash> {
    Box::new(crate::crypto::Sha256Hash)
}

impl Channel {
    pub fn new(
        id: usize,
        tag: Vec<u8>,
        local_zid: Zid,
        local_ssrc: u32,
        config: Config,
        is_first_channel: bool,
    ) -> Self {
        let mut local_menu = config.menu.clone();
        if !is_first_channel && !local_menu.key_agreement.contains(&KeyAgreementAlgo::Multistream) {
            // A later channel can always reuse ZRTPSess, so it advertises Multistream
            // highest-priority; on_hello_in_discovery forces it regardless of this order anyway.
            local_menu.key_agreement.insert(0, KeyAgreementAlgo::Multistream);
        }
        Channel {
            id,
            tag,
            state: ChannelState::DiscoveryInit,
            role: None,
            is_first_channel,
            local_zid,
            peer_zid: None,
            local_ssrc,
            local_menu,
            config,
            agreed: None,
            hash: Box::new(crate::crypto::Sha256Hash),
            hmac: Box::new(crate::crypto::HmacSha256Adapter),
            cipher: Box::new(crate::crypto::Aes128CfbCipher),
            key_agreement: Box::new(crate::crypto::X25519KeyAgreement),
            hash_chain: HashChain::generate(),
            peer_h3: None,
            peer_h2: None,
            peer_h1: None,
            next_sequence: 0,
            last_accepted_sequence: None,
            next_message_id: 0,
            reassembler: Reassembler::new(),
            retransmit: None,
            local_hello: None,
            peer_hello: None,
            local_commit: None,
            peer_commit: None,
            local_dhpart: None,
            peer_dhpart: None,
            cached_row: None,
            local_private_key: None,
            local_public_value: None,
            zrtp_sess: None,
            s0: None,
            keys: None,
        }
    }

    pub fn shared_zrtp_sess(&self) -> Option<&[u8]> {
        self.zrtp_sess.as_deref().map(|v| v.as_slice())
    }

    pub fn adopt_zrtp_sess(&mut self, sess: Zeroizing<Vec<u8>>) {
        self.zrtp_sess = Some(sess);
    }

    pub fn start(&mut self) -> Result<Vec<Action>> {
        self.apply(Event::Init, None)
    }

    pub fn tick(&mut self, _now_ms: u64) -> Result<Vec<Action>> {
        if let Some(retransmit) = &mut self.retransmit {
            if retransmit.tries >= retransmit.max_tries {
                self.retransmit = None;
                return Ok(vec![
                    Action::DisarmTimer,
                    Action::Status {
                        severity: Severity::Error,
                        code: "retransmission cap reached without a reply",
                    },
                ]);
            }
        } else {
            return Ok(vec![]);
        }
        self.apply(Event::Timer, None)
    }

    pub fn deliver(&mut self, raw: &[u8], cache: &mut dyn ZidCache) -> Result<Vec<Action>> {
        log::trace!("channel {}: received {} bytes", self.id, raw.len());
        let parsed = parse_packet(raw)?;
        let (header, message) = match parsed {
            ParsedPacket::Complete { header, message } => (header, message),
            ParsedPacket::Fragment {
                header,
                fragment_header,
                data,
            } => match self.reassembler.push(fragment_header, &data)? {
                Some(bytes) => {
                    let mut cursor = std::io::Cursor::new(&bytes);
                    (header, Message::unmarshal(&mut cursor)?)
                }
                None => return Ok(vec![]),
            },
        };

        if let Some(last) = self.last_accepted_sequence {
            if header.sequence_number <= last && !matches!(message, Message::HelloAck(_) | Message::Conf2Ack(_)) {
                return Err(Error::OutOfOrder {
                    last_seen: last,
                    got: header.sequence_number,
                });
            }
        }
        self.last_accepted_sequence = Some(header.sequence_number);

        self.apply(Event::Message(message), Some(cache))
    }

    fn apply(&mut self, event: Event, cache: Option<&mut dyn ZidCache>) -> Result<Vec<Action>> {
        let before = state_name(&self.state);
        let result = self.apply_inner(event, cache);
        if let Ok(actions) = &result {
            let after = state_name(&self.state);
            if after != before {
                log::debug!("channel {}: {} -> {}", self.id, before, after);
            }
            for action in actions {
                if let Action::Status { severity, code } = action {
                    log::warn!("channel {} ({:?}): {}", self.id, severity, code);
                }
            }
        } else if let Err(err) = &result {
            log::warn!("channel {} in {}: {}", self.id, before, err);
        }
        result
    }

    fn apply_inner(&mut self, event: Event, cache: Option<&mut dyn ZidCache>) -> Result<Vec<Action>> {
        match (&self.state, event) {
            (ChannelState::DiscoveryInit, Event::Init) => self.enter_discovery_init(),
            (ChannelState::DiscoveryInit, Event::Message(Message::Hello(hello))) => {
                self.on_hello_in_discovery(hello, cache)
            }
            (ChannelState::DiscoveryInit, Event::Message(Message::HelloAck(_))) => {
                self.retransmit = None;
                self.state = ChannelState::WaitingForHello;
                Ok(vec![Action::DisarmTimer])
            }
            (ChannelState::DiscoveryInit, Event::Timer) => self.resend(),

            (ChannelState::WaitingForHello, Event::Message(Message::Hello(hello))) => {
                self.on_hello_in_discovery(hello, cache)
            }

            (ChannelState::WaitingForHelloAck, Event::Message(Message::Hello(hello))) => {
                self.on_repeated_hello(hello)
            }
            (ChannelState::WaitingForHelloAck, Event::Message(Message::HelloAck(_))) => {
                self.retransmit = None;
                self.enter_sending_commit()
            }
            (ChannelState::WaitingForHelloAck, Event::Message(Message::Commit(commit))) => {
                self.retransmit = None;
                self.become_responder_from_commit(commit)
            }
            (ChannelState::WaitingForHelloAck, Event::Timer) => self.resend(),

            (ChannelState::SendingCommit, Event::Init) => self.enter_sending_commit(),
            (ChannelState::SendingCommit, Event::Message(Message::Commit(commit))) => {
                self.on_commit_contention(commit)
            }
            (ChannelState::SendingCommit, Event::Message(Message::DhPart1(dhpart))) => {
                self.on_dhpart1(dhpart)
            }
            (ChannelState::SendingCommit, Event::Message(Message::Confirm1(confirm))) => {
                self.on_confirm1_multistream(confirm)
            }
            (ChannelState::SendingCommit, Event::Timer) => self.resend(),

            (ChannelState::ResponderSendingDhPart1, Event::Init) => self.send_dhpart1_once(),
            (ChannelState::ResponderSendingDhPart1, Event::Message(Message::Commit(commit))) => {
                self.on_repeated_commit_resend_dhpart1(commit)
            }
            (ChannelState::ResponderSendingDhPart1, Event::Message(Message::DhPart2(dhpart))) => {
                self.on_dhpart2(dhpart)
            }

            (ChannelState::InitiatorSendingDhPart2, Event::Init) => self.send_dhpart2(),
            (ChannelState::InitiatorSendingDhPart2, Event::Message(Message::DhPart1(_))) => {
                Ok(vec![])
            }
            (ChannelState::InitiatorSendingDhPart2, Event::Message(Message::Confirm1(confirm))) => {
                self.on_confirm1_dh(confirm)
            }
            (ChannelState::InitiatorSendingDhPart2, Event::Timer) => self.resend(),

            (ChannelState::ResponderSendingConfirm1, Event::Init) => self.send_confirm1(),
            (
                ChannelState::ResponderSendingConfirm1,
                Event::Message(Message::Commit(_)) | Event::Message(Message::DhPart2(_)),
            ) => self.resend_once(),
            (ChannelState::ResponderSendingConfirm1, Event::Message(Message::Confirm2(confirm))) => {
                self.on_confirm2(confirm)
            }

            (ChannelState::InitiatorSendingConfirm2, Event::Init) => self.send_confirm2(),
            (ChannelState::InitiatorSendingConfirm2, Event::Message(Message::Confirm1(_))) => {
                Ok(vec![])
            }
            (ChannelState::InitiatorSendingConfirm2, Event::Message(Message::Conf2Ack(_))) => {
                self.retransmit = None;
                self.state = ChannelState::Secure;
                self.finish_secure()
            }
            (ChannelState::InitiatorSendingConfirm2, Event::Timer) => self.resend(),

            (_, Event::Message(Message::Error(e))) => Ok(vec![Action::Status {
                severity: Severity::Error,
                code: error_code_status(e.code),
            }]),
            (_, Event::Message(Message::ErrorAck(_))) => Ok(vec![]),
            (_, Event::Message(Message::SasRelay(_))) => Ok(vec![]),

            (state, Event::Message(message)) => Err(Error::Unexpected {
                state: state_name(state),
                message: message_name(&message),
            }),
            (_, Event::Timer) => Ok(vec![]),
            (_, Event::Init) => Ok(vec![]),
            #[cfg(feature = "goclear")]
            (_, Event::UserGoClear) | (_, Event::AcceptGoClear) => Ok(vec![]),
        }
    }

    // ---- discovery_init / waitingForHello ----

    fn enter_discovery_init(&mut self) -> Result<Vec<Action>> {
        let hello = self.build_hello()?;
        let mut bytes = Vec::new();
        hello.marshal(&mut bytes)?;
        self.local_hello = Some(bytes);
        let message = Message::Hello(hello);
        self.arm_retransmit(&message, self.config.hello_retransmit_initial_ms, self.config.hello_retransmit_max_tries)
    }

    fn build_hello(&self) -> Result<Hello> {
        let mut hello = Hello {
            version: *b"1.10",
            client_id: *b"zrtp-core       ",
            h3: self.hash_chain.h3,
            zid: self.local_zid,
            flags: HelloFlags::default(),
            hash: self.local_menu.hash.clone(),
            cipher: self.local_menu.cipher.clone(),
            auth_tag: self.local_menu.auth_tag.clone(),
            key_agreement: self.local_menu.key_agreement.clone(),
            sas: self.local_menu.sas.clone(),
            mac: [0u8; MAC_LENGTH],
        };
        let mut body = Vec::new();
        hello.marshal(&mut body)?;
        body.truncate(body.len() - MAC_LENGTH);
        hello.mac = hashchain::stored_message_mac(self.hmac.as_ref(), &self.hash_chain.h2, &body)?;
        Ok(hello)
    }

    fn on_hello_in_discovery(
        &mut self,
        hello: Hello,
        cache: Option<&mut dyn ZidCache>,
    ) -> Result<Vec<Action>> {
        self.peer_zid = Some(hello.zid);
        self.peer_h3 = Some(hello.h3);
        let mut agreed = negotiate(&self.local_menu, &Menu {
            hash: hello.hash.clone(),
            cipher: hello.cipher.clone(),
            auth_tag: hello.auth_tag.clone(),
            key_agreement: hello.key_agreement.clone(),
            sas: hello.sas.clone(),
        })?;
        // §4.3: a later channel with a live ZRTPSess always runs Multistream when the peer
        // offers it, regardless of what plain per-category priority picked.
        if self.zrtp_sess.is_some() && hello.key_agreement.contains(&KeyAgreementAlgo::Multistream) {
            agreed.key_agreement = KeyAgreementAlgo::Multistream;
        }
        self.agreed = Some(agreed);
        self.hash = hash_for(self.agreed.as_ref().unwrap());

        if let Some(cache) = cache {
            self.cached_row = Some(cache.load(&hello.zid)?);
        }

        let mut bytes = Vec::new();
        hello.marshal(&mut bytes)?;
        self.peer_hello = Some(bytes);

        self.state = ChannelState::SendingCommit;
        let ack = Message::HelloAck(HelloAck);
        let packets = self.build_packets(&ack)?;
        let send_actions = packets.into_iter().map(Action::Send).collect::<Vec<_>>();
        let mut actions = send_actions;
        actions.extend(self.enter_sending_commit()?);
        Ok(actions)
    }

    fn on_repeated_hello(&mut self, hello: Hello) -> Result<Vec<Action>> {
        let mut bytes = Vec::new();
        hello.marshal(&mut bytes)?;
        if Some(&bytes) != self.peer_hello.as_ref() {
            return Err(Error::UnmatchingRepetition);
        }
        let ack = Message::HelloAck(HelloAck);
        Ok(self.build_packets(&ack)?.into_iter().map(Action::Send).collect())
    }

    // ---- sendingCommit ----

    fn enter_sending_commit(&mut self) -> Result<Vec<Action>> {
        self.state = ChannelState::SendingCommit;
        self.role = Some(Role::Initiator);

        let agreed = self.agreed.clone().ok_or(Error::InvalidContext("algorithms not negotiated"))?;

        let mut commit = if agreed.key_agreement.is_preshared() || matches!(agreed.key_agreement, KeyAgreementAlgo::Multistream) {
            let mut nonce = [0u8; 16];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
            Commit {
                h2: self.hash_chain.h2,
                zid: self.local_zid,
                hash: agreed.hash,
                cipher: agreed.cipher,
                auth_tag: agreed.auth_tag,
                key_agreement: agreed.key_agreement,
                sas: agreed.sas,
                variant: CommitVariant::MultiOrPreshared { nonce, key_id: None },
                mac: [0u8; MAC_LENGTH],
            }
        } else {
            let (public_value, private_key) = self.key_agreement.generate_keypair()?;
            self.local_public_value = Some(public_value.clone());
            self.local_private_key = Some(private_key);

            let dhpart2 = self.build_dhpart()?;
            let mut dhpart2_bytes = Vec::new();
            dhpart2.marshal(&mut dhpart2_bytes)?;
            self.local_dhpart = Some(dhpart2_bytes.clone());

            let mut hvi_input = dhpart2_bytes;
            hvi_input.extend_from_slice(self.peer_hello.as_ref().ok_or(Error::InvalidContext("no peer Hello stored"))?);
            let hvi_full = self.hash.digest(&hvi_input);
            let mut hvi = [0u8; H_IMAGE_LENGTH];
            hvi.copy_from_slice(&hvi_full[..H_IMAGE_LENGTH]);

            Commit {
                h2: self.hash_chain.h2,
                zid: self.local_zid,
                hash: agreed.hash,
                cipher: agreed.cipher,
                auth_tag: agreed.auth_tag,
                key_agreement: agreed.key_agreement,
                sas: agreed.sas,
                variant: CommitVariant::Dh { hvi },
                mac: [0u8; MAC_LENGTH],
            }
        };

        let mut body = Vec::new();
        commit.marshal(&mut body)?;
        body.truncate(body.len() - MAC_LENGTH);
        commit.mac = hashchain::stored_message_mac(self.hmac.as_ref(), &self.hash_chain.h1, &body)?;

        let mut bytes = Vec::new();
        commit.marshal(&mut bytes)?;
        self.local_commit = Some(bytes);

        let message = Message::Commit(commit);
        self.arm_retransmit(&message, self.config.retransmit_initial_ms, self.config.retransmit_max_tries)
    }

    fn on_commit_contention(&mut self, peer_commit: Commit) -> Result<Vec<Action>> {
        let local_commit_bytes = self.local_commit.clone().ok_or(Error::InvalidContext("no local commit stored"))?;
        let mut cursor = std::io::Cursor::new(&local_commit_bytes);
        let local_commit = Commit::unmarshal(&mut cursor)?;

        if we_lose_contention(&local_commit, &peer_commit) {
            self.retransmit = None;
            self.become_responder_from_commit(peer_commit)
        } else {
            // We remain initiator; the peer's commit is ignored (they will yield once they
            // process ours, or already have via the same comparison on their side).
            Ok(vec![])
        }
    }

    fn become_responder_from_commit(&mut self, commit: Commit) -> Result<Vec<Action>> {
        if let Some(peer_h3) = self.peer_h3 {
            verify_reveal(&commit.h2, &peer_h3)?;
        }
        if let Some(peer_hello) = &self.peer_hello {
            hashchain::verify_stored_mac(self.hmac.as_ref(), &commit.h2, peer_hello)?;
        }

        self.role = Some(Role::Responder);
        self.peer_commit = Some(commit.clone());
        self.peer_h2 = Some(commit.h2);

        if commit.key_agreement.is_dh_family() {
            let dhpart1 = self.build_dhpart()?;
            let mut dhpart1_bytes = Vec::new();
            dhpart1.marshal(&mut dhpart1_bytes)?;
            self.local_dhpart = Some(dhpart1_bytes);
            self.state = ChannelState::ResponderSendingDhPart1;
            self.send_dhpart1_once()
        } else {
            self.state = ChannelState::ResponderSendingConfirm1;
            self.send_confirm1()
        }
    }

    fn on_repeated_commit_resend_dhpart1(&mut self, commit: Commit) -> Result<Vec<Action>> {
        let mut bytes = Vec::new();
        commit.marshal(&mut bytes)?;
        let stored = self.peer_commit.as_ref().map(|c| {
            let mut b = Vec::new();
            let _ = c.marshal(&mut b);
            b
        });
        if Some(&bytes) != stored.as_ref() {
            return Err(Error::UnmatchingRepetition);
        }
        self.resend_once()
    }

    // ---- DH phase ----

    fn build_dhpart(&mut self) -> Result<DhPart> {
        if self.local_public_value.is_none() {
            let (public_value, private_key) = self.key_agreement.generate_keypair()?;
            self.local_public_value = Some(public_value);
            self.local_private_key = Some(private_key);
        }
        let public_value = self.local_public_value.clone().unwrap();

        let row = self.cached_row.clone().unwrap_or_default();
        let rs1_ids = compute_secret_ids(self.hmac.as_ref(), select_s1(&row))?;
        let rs2_ids = compute_secret_ids(self.hmac.as_ref(), row.rs2.as_deref())?;
        let peer_h3 = self.peer_h3.unwrap_or([0u8; 32]);
        let local_h3 = self.hash_chain.h3;
        let (h3_initiator, h3_responder) = match self.role {
            Some(Role::Initiator) => (local_h3, peer_h3),
            _ => (peer_h3, local_h3),
        };
        let aux_ids = compute_auxsecret_ids(self.hmac.as_ref(), row.auxsecret.as_deref(), &h3_initiator, &h3_responder)?;
        let pbx_ids = compute_secret_ids(self.hmac.as_ref(), row.pbxsecret.as_deref())?;

        let (rs1_id, rs2_id, auxsecret_id, pbxsecret_id) = match self.role {
            Some(Role::Initiator) => (rs1_ids.initiator_id, rs2_ids.initiator_id, aux_ids.initiator_id, pbx_ids.initiator_id),
            _ => (rs1_ids.responder_id, rs2_ids.responder_id, aux_ids.responder_id, pbx_ids.responder_id),
        };

        let h_field = self.hash_chain.h1;

        let mut dhpart = DhPart {
            h1: h_field,
            rs1_id,
            rs2_id,
            auxsecret_id,
            pbxsecret_id,
            public_value,
            mac: [0u8; MAC_LENGTH],
        };
        let mut body = Vec::new();
        dhpart.marshal(&mut body)?;
        body.truncate(body.len() - MAC_LENGTH);
        dhpart.mac = hashchain::stored_message_mac(self.hmac.as_ref(), &self.hash_chain.h0, &body)?;

        Ok(dhpart)
    }

    fn send_dhpart1_once(&mut self) -> Result<Vec<Action>> {
        let bytes = self.local_dhpart.clone().ok_or(Error::InvalidContext("no DHPart1 built"))?;
        let mut cursor = std::io::Cursor::new(&bytes);
        let dhpart1 = DhPart::unmarshal(&mut cursor)?;
        let message = Message::DhPart1(dhpart1);
        Ok(self.build_packets(&message)?.into_iter().map(Action::Send).collect())
    }

    fn resend_once(&mut self) -> Result<Vec<Action>> {
        if let Some(retransmit) = &self.retransmit {
            Ok(retransmit.packets.clone().into_iter().map(Action::Send).collect())
        } else {
            Ok(vec![])
        }
    }

    fn on_dhpart1(&mut self, dhpart: DhPart) -> Result<Vec<Action>> {
        self.retransmit = None;
        self.peer_dhpart = Some(dhpart.clone());
        let cache_warnings = self.validate_cache_ids(&dhpart)?;

        // The responder never sends Commit in the normal flow, so its H2 never crosses the
        // wire; verify the skipped link directly against its Hello H3 instead.
        if let Some(peer_h3) = self.peer_h3 {
            let h2_candidate = implicit_hash(&dhpart.h1);
            verify_reveal(&h2_candidate, &peer_h3)?;
        }
        self.peer_h1 = Some(dhpart.h1);

        let shared_secret = {
            let private_key = self.local_private_key.as_ref().ok_or(Error::InvalidContext("no local private key"))?;
            self.key_agreement.derive_shared_secret(private_key.as_ref(), &dhpart.public_value)?
        };

        self.compute_s0_dh(&shared_secret)?;
        self.state = ChannelState::InitiatorSendingDhPart2;
        let mut actions = cache_warnings;
        actions.extend(self.send_dhpart2()?);
        Ok(actions)
    }

    fn on_dhpart2(&mut self, dhpart: DhPart) -> Result<Vec<Action>> {
        self.peer_dhpart = Some(dhpart.clone());
        let cache_warnings = self.validate_cache_ids(&dhpart)?;

        if let Some(peer_h2) = self.peer_h2 {
            verify_reveal(&dhpart.h1, &peer_h2)?;
        }
        if let Some(peer_commit) = self.peer_commit.clone() {
            let mut stored = Vec::new();
            peer_commit.marshal(&mut stored)?;
            hashchain::verify_stored_mac(self.hmac.as_ref(), &dhpart.h1, &stored)?;
        }
        self.peer_h1 = Some(dhpart.h1);

        let dhpart2_bytes = {
            let mut b = Vec::new();
            dhpart.marshal(&mut b)?;
            b
        };
        let mut hvi_input = dhpart2_bytes;
        hvi_input.extend_from_slice(self.local_hello.as_ref().ok_or(Error::InvalidContext("no local Hello stored"))?);
        let hvi_full = self.hash.digest(&hvi_input);

        if let Some(Commit { variant: CommitVariant::Dh { hvi }, .. }) = &self.peer_commit {
            if hvi_full[..H_IMAGE_LENGTH].ct_eq(&hvi[..]).unwrap_u8() == 0 {
                return Err(Error::UnmatchingHvi);
            }
        }

        let shared_secret = {
            let private_key = self.local_private_key.as_ref().ok_or(Error::InvalidContext("no local private key"))?;
            self.key_agreement.derive_shared_secret(private_key.as_ref(), &dhpart.public_value)?
        };

        self.compute_s0_dh(&shared_secret)?;
        self.state = ChannelState::ResponderSendingConfirm1;
        let mut actions = cache_warnings;
        actions.extend(self.send_confirm1()?);
        Ok(actions)
    }

    /// A cache ID mismatch is reported to the host but never aborts the exchange (§4.6, §7): the
    /// two sides simply fall back to not sharing that secret, and the SAS carries the burden of
    /// catching an actual MITM.
    fn validate_cache_ids(&mut self, dhpart: &DhPart) -> Result<Vec<Action>> {
        let row = self.cached_row.clone().unwrap_or_default();
        let mut actions = Vec::new();
        if let Some(rs1) = &row.rs1 {
            let ids = compute_secret_ids(self.hmac.as_ref(), Some(rs1.as_slice()))?;
            let expected = match self.role {
                Some(Role::Initiator) => ids.responder_id,
                _ => ids.initiator_id,
            };
            if expected != dhpart.rs1_id {
                actions.push(Action::Status {
                    severity: Severity::Warning,
                    code: "cached secret rs1 does not match the peer-advertised id",
                });
            }
        }
        Ok(actions)
    }

    fn compute_s0_dh(&mut self, shared_secret: &[u8]) -> Result<()> {
        let row = self.cached_row.clone().unwrap_or_default();
        let s1 = select_s1(&row);
        let s1 = s1.map(Secret::Present).unwrap_or(Secret::Absent);
        let s2 = row.auxsecret.as_deref().map(Secret::Present).unwrap_or(Secret::Absent);
        let s3 = row.pbxsecret.as_deref().map(Secret::Present).unwrap_or(Secret::Absent);

        let hello_responder = match self.role {
            Some(Role::Initiator) => self.peer_hello.clone(),
            _ => self.local_hello.clone(),
        }
        .ok_or(Error::InvalidContext("missing responder Hello for total_hash"))?;

        let (commit_bytes, dhpart1_bytes, dhpart2_bytes) = match self.role {
            Some(Role::Initiator) => (
                self.local_commit.clone().unwrap_or_default(),
                {
                    let mut b = Vec::new();
                    if let Some(p) = &self.peer_dhpart {
                        p.marshal(&mut b)?;
                    }
                    b
                },
                self.local_dhpart.clone().unwrap_or_default(),
            ),
            _ => (
                {
                    let mut b = Vec::new();
                    if let Some(p) = &self.peer_commit {
                        p.marshal(&mut b)?;
                    }
                    b
                },
                self.local_dhpart.clone().unwrap_or_default(),
                {
                    let mut b = Vec::new();
                    if let Some(p) = &self.peer_dhpart {
                        p.marshal(&mut b)?;
                    }
                    b
                },
            ),
        };

        let th = total_hash(self.hash.as_ref(), &[&hello_responder, &commit_bytes, &dhpart1_bytes, &dhpart2_bytes]);
        let (zid_i, zid_r) = self.zid_pair();
        let ctx = kdf_context(&zid_i, &zid_r, &th);

        let s0 = s0_dh(self.hash.as_ref(), shared_secret, &ctx, &s1, &s2, &s3);
        let agreed = self.agreed.clone().ok_or(Error::InvalidContext("algorithms not negotiated"))?;
        let keys = keyschedule::derive_channel_keys(self.hmac.as_ref(), &s0, &ctx, &agreed)?;

        if self.is_first_channel {
            let sess = keyschedule::derive_zrtp_sess(self.hmac.as_ref(), &s0, &ctx, agreed.hash_len())?;
            self.zrtp_sess = Some(Zeroizing::new(sess));
        }

        self.s0 = Some(Zeroizing::new(s0));
        self.keys = Some(keys);
        Ok(())
    }

    fn zid_pair(&self) -> (Zid, Zid) {
        let peer = self.peer_zid.unwrap_or_default();
        match self.role {
            Some(Role::Initiator) => (self.local_zid, peer),
            _ => (peer, self.local_zid),
        }
    }

    fn send_dhpart2(&mut self) -> Result<Vec<Action>> {
        let bytes = self.local_dhpart.clone().ok_or(Error::InvalidContext("no DHPart2 built"))?;
        let mut cursor = std::io::Cursor::new(&bytes);
        let dhpart2 = DhPart::unmarshal(&mut cursor)?;
        let message = Message::DhPart2(dhpart2);
        self.arm_retransmit(&message, self.config.retransmit_initial_ms, self.config.retransmit_max_tries)
    }

    // ---- multistream ----

    fn on_confirm1_multistream(&mut self, confirm: Confirm) -> Result<Vec<Action>> {
        let zrtp_sess = self.zrtp_sess.clone().ok_or(Error::InvalidContext("no ZRTPSess available for multistream"))?;
        let agreed = self.agreed.clone().ok_or(Error::InvalidContext("algorithms not negotiated"))?;

        let hello_responder = self.peer_hello.clone().ok_or(Error::InvalidContext("no peer Hello stored"))?;
        let commit_bytes = self.local_commit.clone().unwrap_or_default();
        let th = total_hash(self.hash.as_ref(), &[&hello_responder, &commit_bytes]);
        let (zid_i, zid_r) = self.zid_pair();
        let ctx = kdf_context(&zid_i, &zid_r, &th);

        let s0 = s0_multistream(self.hmac.as_ref(), &zrtp_sess, &ctx, agreed.hash_len())?;
        let keys = keyschedule::derive_channel_keys(self.hmac.as_ref(), &s0, &ctx, &agreed)?;
        self.s0 = Some(Zeroizing::new(s0));
        self.keys = Some(keys);

        self.open_and_check_confirm(&confirm, true)?;
        self.state = ChannelState::InitiatorSendingConfirm2;
        self.send_confirm2()
    }

    fn on_confirm1_dh(&mut self, confirm: Confirm) -> Result<Vec<Action>> {
        self.retransmit = None;
        self.open_and_check_confirm(&confirm, true)?;
        self.state = ChannelState::InitiatorSendingConfirm2;
        self.send_confirm2()
    }

    fn open_and_check_confirm(&mut self, confirm: &Confirm, from_responder: bool) -> Result<()> {
        let keys = self.keys.as_ref().ok_or(Error::InvalidContext("no channel keys derived"))?;
        let (zrtp_key, mackey) = if from_responder {
            (&keys.zrtpkey_r, &keys.mackey_r)
        } else {
            (&keys.zrtpkey_i, &keys.mackey_i)
        };
        let plain = open_confirm(self.cipher.as_ref(), self.hmac.as_ref(), zrtp_key, mackey, confirm)?;

        // Multistream channels skip the DHPart step, so there is no stored H1 to check the
        // revealed H0 against.
        if let Some(peer_h1) = self.peer_h1 {
            verify_reveal(&plain.h0, &peer_h1)?;
        }
        if let Some(peer_dhpart) = self.peer_dhpart.clone() {
            let mut stored = Vec::new();
            peer_dhpart.marshal(&mut stored)?;
            hashchain::verify_stored_mac(self.hmac.as_ref(), &plain.h0, &stored)?;
        }
        Ok(())
    }

    fn send_confirm1(&mut self) -> Result<Vec<Action>> {
        let keys = self.keys.as_ref().ok_or(Error::InvalidContext("no channel keys derived"))?;
        let plain = ConfirmPlain {
            h0: self.hash_chain.h0,
            flags: ConfirmPlainFlags::default(),
            cache_expiration: 0,
            signature: None,
        };
        let iv = vec![0u8; self.cipher.iv_len()];
        let confirm = build_confirm(self.cipher.as_ref(), self.hmac.as_ref(), &keys.zrtpkey_r, &keys.mackey_r, iv, plain)?;
        let message = Message::Confirm1(confirm);
        Ok(self.build_packets(&message)?.into_iter().map(Action::Send).collect())
    }

    fn send_confirm2(&mut self) -> Result<Vec<Action>> {
        let keys = self.keys.as_ref().ok_or(Error::InvalidContext("no channel keys derived"))?;
        let plain = ConfirmPlain {
            h0: self.hash_chain.h0,
            flags: ConfirmPlainFlags::default(),
            cache_expiration: 0,
            signature: None,
        };
        let iv = vec![0u8; self.cipher.iv_len()];
        let confirm = build_confirm(self.cipher.as_ref(), self.hmac.as_ref(), &keys.zrtpkey_i, &keys.mackey_i, iv, plain)?;
        let message = Message::Confirm2(confirm);
        self.arm_retransmit(&message, self.config.retransmit_initial_ms, self.config.retransmit_max_tries)
    }

    fn on_confirm2(&mut self, confirm: Confirm) -> Result<Vec<Action>> {
        self.open_and_check_confirm(&confirm, false)?;
        self.state = ChannelState::Secure;
        let mut actions = self.finish_secure()?;
        let ack = Message::Conf2Ack(Conf2Ack);
        actions.extend(self.build_packets(&ack)?.into_iter().map(Action::Send));
        Ok(actions)
    }

    fn finish_secure(&mut self) -> Result<Vec<Action>> {
        let s0 = self.s0.clone().ok_or(Error::InvalidContext("s0 missing at secure transition"))?;
        let agreed = self.agreed.clone().ok_or(Error::InvalidContext("algorithms not negotiated"))?;
        let hello_responder = match self.role {
            Some(Role::Initiator) => self.peer_hello.clone(),
            _ => self.local_hello.clone(),
        }
        .unwrap_or_default();
        let commit_bytes = match self.role {
            Some(Role::Initiator) => self.local_commit.clone(),
            _ => self.peer_commit.as_ref().map(|c| {
                let mut b = Vec::new();
                let _ = c.marshal(&mut b);
                b
            }),
        }
        .unwrap_or_default();
        let th = total_hash(self.hash.as_ref(), &[&hello_responder, &commit_bytes]);
        let (zid_i, zid_r) = self.zid_pair();
        let ctx = kdf_context(&zid_i, &zid_r, &th);

        let srtp_secrets = keyschedule::derive_srtp_secrets(self.hmac.as_ref(), &s0, &ctx, &agreed)?;
        let sas_value = keyschedule::derive_sas_value(self.hmac.as_ref(), &s0, &ctx)?;
        let sas = keyschedule::render_base32(sas_value);

        let mut actions = vec![
            Action::DisarmTimer,
            Action::SecretsAvailable(srtp_secrets),
            Action::StartSrtp { sas, sas_verified: false },
        ];

        if agreed.key_agreement.is_dh_family() {
            let new_rs1 = keyschedule::derive_new_rs1(self.hmac.as_ref(), &s0, &ctx)?;
            let mut row = self.cached_row.clone().unwrap_or_default();
            rotate_rs1(&mut row, new_rs1);
            self.cached_row = Some(row.clone());
            if let Some(peer_zid) = self.peer_zid {
                actions.push(Action::StoreCache { peer_zid, row });
            }
        }

        Ok(actions)
    }

    pub fn cached_row(&self) -> Option<&CachedQuadruple> {
        self.cached_row.as_ref()
    }

    // ---- wire helpers ----

    fn build_packets(&mut self, message: &Message) -> Result<Vec<Vec<u8>>> {
        let header = PacketHeader {
            fragmented: false,
            sequence_number: self.next_sequence,
            source_ssrc: self.local_ssrc,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        build_packets(header, message, self.config.mtu, message_id)
    }

    fn arm_retransmit(&mut self, message: &Message, initial_ms: u64, max_tries: u32) -> Result<Vec<Action>> {
        let packets = self.build_packets(message)?;
        let send_actions = packets.clone().into_iter().map(Action::Send);
        self.retransmit = Some(RetransmitState {
            packets,
            interval_ms: initial_ms,
            cap_ms: if max_tries == self.config.hello_retransmit_max_tries {
                self.config.hello_retransmit_cap_ms
            } else {
                self.config.retransmit_cap_ms
            },
            tries: 0,
            max_tries,
        });
        let mut actions: Vec<Action> = send_actions.collect();
        actions.push(Action::ArmTimer { interval_ms: initial_ms });
        Ok(actions)
    }

    fn resend(&mut self) -> Result<Vec<Action>> {
        let next_seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let retransmit = self.retransmit.as_mut().ok_or(Error::InvalidContext("no retransmission in progress"))?;
        retransmit.tries += 1;
        retransmit.interval_ms = (retransmit.interval_ms * 2).min(retransmit.cap_ms);

        let mut actions = Vec::new();
        for packet in retransmit.packets.iter_mut() {
            PacketHeader::rewrite_sequence_number(packet, next_seq)?;
            actions.push(Action::Send(packet.clone()));
        }
        actions.push(Action::ArmTimer { interval_ms: retransmit.interval_ms });
        Ok(actions)
    }
}

/// §4.5 commit contention: returns true if the local side must yield and become responder.
fn we_lose_contention(local: &Commit, peer: &Commit) -> bool {
    let local_preshared = matches!(local.key_agreement, KeyAgreementAlgo::Preshared);
    let peer_preshared = matches!(peer.key_agreement, KeyAgreementAlgo::Preshared);

    if local.key_agreement != peer.key_agreement && (local_preshared || peer_preshared) {
        return local_preshared;
    }

    local.contention_value() < peer.contention_value()
}

fn state_name(state: &ChannelState) -> &'static str {
    match state {
        ChannelState::DiscoveryInit => "discovery_init",
        ChannelState::WaitingForHello => "waitingForHello",
        ChannelState::WaitingForHelloAck => "waitingForHelloAck",
        ChannelState::SendingCommit => "sendingCommit",
        ChannelState::ResponderSendingDhPart1 => "responderSendingDHPart1",
        ChannelState::InitiatorSendingDhPart2 => "initiatorSendingDHPart2",
        ChannelState::ResponderSendingConfirm1 => "responderSendingConfirm1",
        ChannelState::InitiatorSendingConfirm2 => "initiatorSendingConfirm2",
        ChannelState::Secure => "secure",
        #[cfg(feature = "goclear")]
        ChannelState::SendingGoClear => "sendingGoClear",
        #[cfg(feature = "goclear")]
        ChannelState::Clear => "clear",
        ChannelState::Failed => "failed",
    }
}

fn message_name(message: &Message) -> &'static str {
    match message {
        Message::Hello(_) => "Hello",
        Message::HelloAck(_) => "HelloACK",
        Message::Commit(_) => "Commit",
        Message::DhPart1(_) => "DHPart1",
        Message::DhPart2(_) => "DHPart2",
        Message::Confirm1(_) => "Confirm1",
        Message::Confirm2(_) => "Confirm2",
        Message::Conf2Ack(_) => "Conf2ACK",
        Message::Error(_) => "Error",
        Message::ErrorAck(_) => "ErrorACK",
        Message::Ping(_) => "Ping",
        Message::PingAck(_) => "PingACK",
        Message::SasRelay(_) => "SASrelay",
        Message::GoClear(_) => "GoClear",
        Message::ClearAck(_) => "ClearACK",
    }
}

fn error_code_status(_code: u32) -> &'static str {
    "peer reported a ZRTP Error"
}
