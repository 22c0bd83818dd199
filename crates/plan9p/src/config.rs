//! Session parameters supplied by the embedding program.

use crate::fcall::{IOHDRSZ, P92000};

/// Default maximum message size offered during negotiation.
pub const DEFAULT_MSIZE: u32 = 32768;

/// Smallest msize either side will accept; leaves room for a useful `Rread`.
pub const MIN_MSIZE: u32 = 256;

/// Parameters of a client session or of a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest message this side is willing to send or receive.
    pub msize: u32,
    /// Protocol version string offered (client) or spoken (server).
    pub version: String,
}

impl Config {
    pub fn new(msize: u32, version: impl Into<String>) -> Config {
        Config {
            msize: msize.max(MIN_MSIZE),
            version: version.into(),
        }
    }

    /// Largest `count` of a read or write that fits a message of `msize` bytes.
    pub fn iounit(msize: u32) -> u32 {
        msize.saturating_sub(IOHDRSZ)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(DEFAULT_MSIZE, P92000)
    }
}

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.msize, 32768);
    assert_eq!(config.version, "9P2000");
    assert_eq!(Config::new(16, "9P2000").msize, MIN_MSIZE);
    assert_eq!(Config::iounit(8192), 8192 - 24);
    assert_eq!(Config::iounit(10), 0);
}
