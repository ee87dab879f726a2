//! Engine configuration (validated once, then treated as read-only for the life of a `Session`).

use crate::error::{Error, Result};
use crate::negotiation::Menu;

pub const DEFAULT_MTU: usize = 1452;
pub const MIN_MTU: usize = 600;
pub const DEFAULT_MAX_CHANNELS: usize = 64;

pub const HELLO_RETRANSMIT_INITIAL_MS: u64 = 50;
pub const HELLO_RETRANSMIT_CAP_MS: u64 = 200;
pub const HELLO_RETRANSMIT_MAX_TRIES: u32 = 20;

pub const RETRANSMIT_INITIAL_MS: u64 = 150;
pub const RETRANSMIT_CAP_MS: u64 = 1200;
pub const RETRANSMIT_MAX_TRIES: u32 = 10;

/// A session's static configuration. Passed once to `Session::new` and never mutated after.
#[derive(Clone, Debug)]
pub struct Config {
    /// Algorithms this endpoint is willing to offer/accept, in preference order.
    pub menu: Menu,

    /// Largest packet this engine will hand to the host for one send (§4.1 fragmentation).
    pub mtu: usize,

    /// A session may multiplex several media channels (§5); this caps how many `channel_add`
    /// accepts before returning `Error::TooManyChannels`.
    pub max_channels: usize,

    pub hello_retransmit_initial_ms: u64,
    pub hello_retransmit_cap_ms: u64,
    pub hello_retransmit_max_tries: u32,

    pub retransmit_initial_ms: u64,
    pub retransmit_cap_ms: u64,
    pub retransmit_max_tries: u32,

    /// Whether this endpoint will ever send or honor GoClear (compiled out entirely unless the
    /// `goclear` feature is enabled, matching §4.1's "MUST be disabled by default").
    pub allow_goclear: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            menu: Menu::default_menu(),
            mtu: DEFAULT_MTU,
            max_channels: DEFAULT_MAX_CHANNELS,
            hello_retransmit_initial_ms: HELLO_RETRANSMIT_INITIAL_MS,
            hello_retransmit_cap_ms: HELLO_RETRANSMIT_CAP_MS,
            hello_retransmit_max_tries: HELLO_RETRANSMIT_MAX_TRIES,
            retransmit_initial_ms: RETRANSMIT_INITIAL_MS,
            retransmit_cap_ms: RETRANSMIT_CAP_MS,
            retransmit_max_tries: RETRANSMIT_MAX_TRIES,
            allow_goclear: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::InvalidContext("mtu below the minimum ZRTP packet size"));
        }
        if self.max_channels == 0 {
            return Err(Error::InvalidContext("max_channels must be at least 1"));
        }
        if self.menu.hash.is_empty()
            || self.menu.cipher.is_empty()
            || self.menu.auth_tag.is_empty()
            || self.menu.key_agreement.is_empty()
            || self.menu.sas.is_empty()
        {
            return Err(Error::InvalidContext(
                "menu categories must not be empty (mandatory algorithms are injected automatically)",
            ));
        }
        if self.allow_goclear && !cfg!(feature = "goclear") {
            return Err(Error::InvalidContext(
                "allow_goclear set but the goclear feature was not compiled in",
            ));
        }
        if self.hello_retransmit_initial_ms == 0 || self.retransmit_initial_ms == 0 {
            return Err(Error::InvalidContext("retransmission intervals must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn mtu_below_floor_is_rejected() {
        let config = Config {
            mtu: 100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_channels_is_rejected() {
        let config = Config {
            max_channels: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_menu_category_is_rejected() {
        let config = Config {
            menu: Menu {
                hash: vec![],
                ..Menu::default_menu()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
