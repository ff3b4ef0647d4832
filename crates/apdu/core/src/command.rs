//! Command APDU helpers
//!
//! Commands arrive at the bridge as opaque byte strings chosen by remote
//! clients. The bridge never builds commands on their behalf beyond the few
//! protocol frames it needs itself (GET RESPONSE, MANAGE CHANNEL, SELECT), so
//! this module only classifies raw commands far enough to rewrite the Le field
//! and the CLA channel bits.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// ISO/IEC 7816-3 command case, distinguishing short and extended length encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduCase {
    /// Header only
    Case1,
    /// Header + Le (1 byte)
    Case2Short,
    /// Header + Lc + data
    Case3Short,
    /// Header + Lc + data + Le (1 byte)
    Case4Short,
    /// Header + 00 + Le (2 bytes)
    Case2Extended,
    /// Header + 00 + Lc (2 bytes) + data
    Case3Extended,
    /// Header + 00 + Lc (2 bytes) + data + Le (2 bytes)
    Case4Extended,
}

/// A borrowed, validated command APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandApdu<'a> {
    bytes: &'a [u8],
    case: ApduCase,
}

impl<'a> CommandApdu<'a> {
    /// Classify raw command bytes
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let len = bytes.len();
        if len < 4 {
            return Err(Error::InvalidCommand("command shorter than its header"));
        }

        let case = match len {
            4 => ApduCase::Case1,
            5 => ApduCase::Case2Short,
            _ if bytes[4] != 0 => {
                let lc = usize::from(bytes[4]);
                if len == 5 + lc {
                    ApduCase::Case3Short
                } else if len == 6 + lc {
                    ApduCase::Case4Short
                } else {
                    return Err(Error::InvalidCommand("Lc does not match the data length"));
                }
            }
            7 => ApduCase::Case2Extended,
            _ if len > 7 => {
                let lc = usize::from(u16::from_be_bytes([bytes[5], bytes[6]]));
                if lc == 0 {
                    return Err(Error::InvalidCommand("extended Lc of zero"));
                }
                if len == 7 + lc {
                    ApduCase::Case3Extended
                } else if len == 9 + lc {
                    ApduCase::Case4Extended
                } else {
                    return Err(Error::InvalidCommand("Lc does not match the data length"));
                }
            }
            _ => return Err(Error::InvalidCommand("malformed extended length field")),
        };

        Ok(Self { bytes, case })
    }

    /// Command case
    pub const fn case(&self) -> ApduCase {
        self.case
    }

    /// Class byte
    pub const fn cla(&self) -> u8 {
        self.bytes[0]
    }

    /// Instruction byte
    pub const fn ins(&self) -> u8 {
        self.bytes[1]
    }

    /// The raw command bytes
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Whether the command carries an Le field
    pub const fn has_le(&self) -> bool {
        matches!(
            self.case,
            ApduCase::Case2Short
                | ApduCase::Case4Short
                | ApduCase::Case2Extended
                | ApduCase::Case4Extended
        )
    }

    /// Rebuild the command with its expected length set to `le`
    ///
    /// An existing Le field is replaced; commands without one get it appended
    /// in the same length encoding as the rest of the command.
    pub fn with_le(&self, le: u8) -> Bytes {
        let len = self.bytes.len();
        let mut buffer = BytesMut::with_capacity(len + 2);

        match self.case {
            ApduCase::Case1 | ApduCase::Case3Short => {
                buffer.put_slice(self.bytes);
                buffer.put_u8(le);
            }
            ApduCase::Case2Short | ApduCase::Case4Short => {
                buffer.put_slice(&self.bytes[..len - 1]);
                buffer.put_u8(le);
            }
            ApduCase::Case3Extended => {
                buffer.put_slice(self.bytes);
                buffer.put_slice(&[0x00, le]);
            }
            ApduCase::Case2Extended | ApduCase::Case4Extended => {
                buffer.put_slice(&self.bytes[..len - 2]);
                buffer.put_slice(&[0x00, le]);
            }
        }

        buffer.freeze()
    }
}

/// Encode a logical channel number into a class byte
///
/// Channels 0 to 3 use the first interindustry coding, channels 4 to 19 the
/// further interindustry coding. `FF` is not a class byte and is left alone.
pub const fn with_channel(cla: u8, channel: u8) -> u8 {
    if cla == 0xFF {
        cla
    } else if channel <= 3 {
        (cla & 0x9C) | channel
    } else {
        (cla & 0x90) | 0x40 | ((channel - 4) & 0x0F)
    }
}

/// Decode a hex string, tolerating mixed case and embedded whitespace
pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| Error::InvalidHex(format!("{input:?}: {e}")))
}

/// Encode bytes as lowercase hex, the format responses are returned in
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
