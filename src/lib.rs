#![warn(rust_2018_idioms)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hashchain;
pub mod host;
pub mod keyschedule;
pub mod negotiation;
pub mod secrets;
pub mod session;
pub mod zid;

pub use channel::{Action, Channel, ChannelState, Severity};
pub use config::Config;
pub use error::{Error, Result};
pub use host::{Host, ZidCache};
pub use session::Session;
pub use zid::Zid;
