//! Algorithm negotiation: 4-byte ASCII tags, per-category menus, and selection (§4.3).

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Max entries per category a Hello may advertise (hc/cc/ac/kc/sc, each clamped to 7).
pub const MAX_MENU_LEN: usize = 7;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha384,
    Unsupported([u8; 4]),
}

impl HashAlgo {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            HashAlgo::Sha256 => *b"S256",
            HashAlgo::Sha384 => *b"S384",
            HashAlgo::Unsupported(t) => *t,
        }
    }
}

impl From<[u8; 4]> for HashAlgo {
    fn from(tag: [u8; 4]) -> Self {
        match &tag {
            b"S256" => HashAlgo::Sha256,
            b"S384" => HashAlgo::Sha384,
            _ => HashAlgo::Unsupported(tag),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherAlgo {
    Aes1Cfb,
    Aes3Cfb,
    TwoFish1,
    Unsupported([u8; 4]),
}

impl CipherAlgo {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            CipherAlgo::Aes1Cfb => *b"AES1",
            CipherAlgo::Aes3Cfb => *b"AES3",
            CipherAlgo::TwoFish1 => *b"2FS1",
            CipherAlgo::Unsupported(t) => *t,
        }
    }
}

impl From<[u8; 4]> for CipherAlgo {
    fn from(tag: [u8; 4]) -> Self {
        match &tag {
            b"AES1" => CipherAlgo::Aes1Cfb,
            b"AES3" => CipherAlgo::Aes3Cfb,
            b"2FS1" => CipherAlgo::TwoFish1,
            _ => CipherAlgo::Unsupported(tag),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthTagAlgo {
    HmacSha132,
    HmacSha180,
    Unsupported([u8; 4]),
}

impl AuthTagAlgo {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            AuthTagAlgo::HmacSha132 => *b"HS32",
            AuthTagAlgo::HmacSha180 => *b"HS80",
            AuthTagAlgo::Unsupported(t) => *t,
        }
    }

    /// Effective SRTP auth-tag length in bytes.
    pub fn tag_len(&self) -> usize {
        match self {
            AuthTagAlgo::HmacSha132 => 4,
            AuthTagAlgo::HmacSha180 => 10,
            AuthTagAlgo::Unsupported(_) => 4,
        }
    }
}

impl From<[u8; 4]> for AuthTagAlgo {
    fn from(tag: [u8; 4]) -> Self {
        match &tag {
            b"HS32" => AuthTagAlgo::HmacSha132,
            b"HS80" => AuthTagAlgo::HmacSha180,
            _ => AuthTagAlgo::Unsupported(tag),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyAgreementAlgo {
    Dh3072,
    Dh4096,
    Ec25,
    Multistream,
    Preshared,
    Unsupported([u8; 4]),
}

impl KeyAgreementAlgo {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            KeyAgreementAlgo::Dh3072 => *b"DH3k",
            KeyAgreementAlgo::Dh4096 => *b"DH4k",
            KeyAgreementAlgo::Ec25 => *b"EC25",
            KeyAgreementAlgo::Multistream => *b"Mult",
            KeyAgreementAlgo::Preshared => *b"Prsh",
            KeyAgreementAlgo::Unsupported(t) => *t,
        }
    }

    /// DH/ECDH/KEM modes perform a DHPart exchange; Multistream and Preshared do not.
    pub fn is_dh_family(&self) -> bool {
        !matches!(
            self,
            KeyAgreementAlgo::Multistream | KeyAgreementAlgo::Preshared
        )
    }

    pub fn is_preshared(&self) -> bool {
        matches!(self, KeyAgreementAlgo::Preshared)
    }
}

impl From<[u8; 4]> for KeyAgreementAlgo {
    fn from(tag: [u8; 4]) -> Self {
        match &tag {
            b"DH3k" => KeyAgreementAlgo::Dh3072,
            b"DH4k" => KeyAgreementAlgo::Dh4096,
            b"EC25" => KeyAgreementAlgo::Ec25,
            b"Mult" => KeyAgreementAlgo::Multistream,
            b"Prsh" => KeyAgreementAlgo::Preshared,
            _ => KeyAgreementAlgo::Unsupported(tag),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SasAlgo {
    Base32,
    Base256,
    Unsupported([u8; 4]),
}

impl SasAlgo {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            SasAlgo::Base32 => *b"B32 ",
            SasAlgo::Base256 => *b"B256",
            SasAlgo::Unsupported(t) => *t,
        }
    }
}

impl From<[u8; 4]> for SasAlgo {
    fn from(tag: [u8; 4]) -> Self {
        match &tag {
            b"B32 " => SasAlgo::Base32,
            b"B256" => SasAlgo::Base256,
            _ => SasAlgo::Unsupported(tag),
        }
    }
}

pub(crate) fn marshal_tag<W: Write>(writer: &mut W, tag: [u8; 4]) -> Result<()> {
    writer.write_all(&tag)?;
    Ok(())
}

pub(crate) fn unmarshal_tag<R: Read>(reader: &mut R) -> Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag)?;
    Ok(tag)
}

/// One endpoint's offered algorithms, ordered by preference (index 0 = most preferred).
#[derive(Clone, Debug, Default)]
pub struct Menu {
    pub hash: Vec<HashAlgo>,
    pub cipher: Vec<CipherAlgo>,
    pub auth_tag: Vec<AuthTagAlgo>,
    pub key_agreement: Vec<KeyAgreementAlgo>,
    pub sas: Vec<SasAlgo>,
}

impl Menu {
    /// The RFC's suggested default menu: a small, widely-interoperable set.
    pub fn default_menu() -> Self {
        Menu {
            hash: vec![HashAlgo::Sha256],
            cipher: vec![CipherAlgo::Aes1Cfb],
            auth_tag: vec![AuthTagAlgo::HmacSha132, AuthTagAlgo::HmacSha180],
            key_agreement: vec![KeyAgreementAlgo::Dh3072, KeyAgreementAlgo::Ec25],
            sas: vec![SasAlgo::Base32],
        }
    }

    fn truncate(&mut self) {
        self.hash.truncate(MAX_MENU_LEN);
        self.cipher.truncate(MAX_MENU_LEN);
        self.auth_tag.truncate(MAX_MENU_LEN);
        self.key_agreement.truncate(MAX_MENU_LEN);
        self.sas.truncate(MAX_MENU_LEN);
    }
}

/// Mandatory algorithms injected into a menu if the caller's configuration omitted them (§4.3).
fn ensure_mandatory(menu: &mut Menu) {
    if !menu.hash.contains(&HashAlgo::Sha256) {
        menu.hash.push(HashAlgo::Sha256);
    }
    if !menu.cipher.contains(&CipherAlgo::Aes1Cfb) {
        menu.cipher.push(CipherAlgo::Aes1Cfb);
    }
    if !menu.auth_tag.contains(&AuthTagAlgo::HmacSha132) {
        menu.auth_tag.push(AuthTagAlgo::HmacSha132);
    }
    if !menu.key_agreement.contains(&KeyAgreementAlgo::Dh3072) {
        menu.key_agreement.push(KeyAgreementAlgo::Dh3072);
    }
    if !menu.sas.contains(&SasAlgo::Base32) {
        menu.sas.push(SasAlgo::Base32);
    }
    menu.truncate();
}

/// The result of intersecting a local menu against a peer's advertised menu.
#[derive(Clone, Debug)]
pub struct Agreed {
    pub hash: HashAlgo,
    pub cipher: CipherAlgo,
    pub auth_tag: AuthTagAlgo,
    pub key_agreement: KeyAgreementAlgo,
    pub sas: SasAlgo,
}

fn pick<T: Copy + PartialEq>(local: &[T], peer: &[T]) -> Option<T> {
    local.iter().copied().find(|entry| peer.contains(entry))
}

/// Select one algorithm per category: the highest-priority local entry also present in the
/// peer's advertised menu, after injecting mandatory algorithms into both sides (§4.3).
pub fn negotiate(local: &Menu, peer: &Menu) -> Result<Agreed> {
    let mut local = local.clone();
    let mut peer = peer.clone();
    ensure_mandatory(&mut local);
    ensure_mandatory(&mut peer);

    Ok(Agreed {
        hash: pick(&local.hash, &peer.hash).ok_or(Error::BuilderFailure("no common hash algo"))?,
        cipher: pick(&local.cipher, &peer.cipher)
            .ok_or(Error::BuilderFailure("no common cipher algo"))?,
        auth_tag: pick(&local.auth_tag, &peer.auth_tag)
            .ok_or(Error::BuilderFailure("no common auth-tag algo"))?,
        key_agreement: pick(&local.key_agreement, &peer.key_agreement)
            .ok_or(Error::BuilderFailure("no common key-agreement algo"))?,
        sas: pick(&local.sas, &peer.sas).ok_or(Error::BuilderFailure("no common SAS algo"))?,
    })
}

impl Agreed {
    pub fn hash_len(&self) -> usize {
        match self.hash {
            HashAlgo::Sha384 => 48,
            _ => 32,
        }
    }

    pub fn cipher_key_len(&self) -> usize {
        match self.cipher {
            CipherAlgo::Aes3Cfb => 32,
            _ => 16,
        }
    }

    pub fn sas_render_len(&self) -> usize {
        match self.sas {
            SasAlgo::Base256 => 2,
            SasAlgo::Base32 | SasAlgo::Unsupported(_) => 4,
        }
    }
}

#[cfg(test)]
mod negotiation_test {
    use super::*;

    #[test]
    fn picks_highest_priority_common_entry() {
        let local = Menu {
            hash: vec![HashAlgo::Sha384, HashAlgo::Sha256],
            ..Menu::default_menu()
        };
        let peer = Menu::default_menu();
        let agreed = negotiate(&local, &peer).unwrap();
        assert_eq!(agreed.hash, HashAlgo::Sha256);
    }

    #[test]
    fn mandatory_algos_are_injected() {
        let local = Menu {
            hash: vec![],
            cipher: vec![],
            auth_tag: vec![],
            key_agreement: vec![],
            sas: vec![],
        };
        let peer = Menu::default_menu();
        let agreed = negotiate(&local, &peer).unwrap();
        assert_eq!(agreed.hash, HashAlgo::Sha256);
        assert_eq!(agreed.cipher, CipherAlgo::Aes1Cfb);
        assert_eq!(agreed.auth_tag, AuthTagAlgo::HmacSha132);
        assert_eq!(agreed.key_agreement, KeyAgreementAlgo::Dh3072);
        assert_eq!(agreed.sas, SasAlgo::Base32);
    }
}
