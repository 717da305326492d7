//! core data types for the WPAN transceiver

pub mod crc;
pub mod stream;
pub mod types;

pub use self::crc::{crc16, crc32, CrcKind, FCS16, FCS32};
pub use stream::SampleStream;
pub use types::*;
