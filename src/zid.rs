use std::fmt;
use std::io::{Read, Write};

use rand::Rng;

use crate::error::Result;

pub const ZID_LENGTH: usize = 12;

/// A 12-byte identifier naming one endpoint, persistent across sessions.
///
/// Generated once per endpoint (by the host, or randomly by `Zid::random` the first time a
/// session is created with none supplied) and stored alongside the ZID cache row it indexes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Zid([u8; ZID_LENGTH]);

impl Zid {
    pub fn new(bytes: [u8; ZID_LENGTH]) -> Self {
        Zid(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ZID_LENGTH];
        rand::thread_rng().fill(&mut bytes);
        Zid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ZID_LENGTH] {
        &self.0
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.0)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; ZID_LENGTH];
        reader.read_exact(&mut bytes)?;
        Ok(Zid(bytes))
    }
}

impl fmt::Debug for Zid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zid(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
