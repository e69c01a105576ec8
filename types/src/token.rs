use crate::message::Volatility;
use bytes::{Buf, BufMut};
use commonware_codec::{Error, FixedSize, Read, Write};
use commonware_utils::hex;
use std::fmt;

/// Length in bytes of state and context tokens.
pub const TOKEN_LEN: usize = 32;

/// Bit in the first token byte carrying the volatility flag.
const VOLATILE_BIT: u8 = 0x80;

/// An opaque transaction handle issued by the storage layer.
///
/// The high bit of the first byte carries the volatility
/// (volatile = 1, readonly = 0) and never changes after issuance; the
/// remaining 255 bits are meaningful only to the transaction manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateToken([u8; TOKEN_LEN]);

impl StateToken {
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero token handed to pure frames (no state access).
    pub fn zero() -> Self {
        Self([0u8; TOKEN_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn is_volatile(&self) -> bool {
        self.0[0] & VOLATILE_BIT != 0
    }

    /// Token-level volatility: volatile or readonly. (Pure frames carry no
    /// usable token at all.)
    pub fn volatility(&self) -> Volatility {
        if self.is_volatile() {
            Volatility::Volatile
        } else {
            Volatility::Readonly
        }
    }

    /// The readonly view of this token: the same underlying transaction
    /// with the volatility bit cleared. Views are not new tokens and are
    /// never subject to discard cleanup on their own.
    pub fn readonly_view(&self) -> Self {
        let mut bytes = self.0;
        bytes[0] &= !VOLATILE_BIT;
        Self(bytes)
    }

    /// Whether two tokens reference the same underlying transaction,
    /// ignoring the volatility bit.
    pub fn same_transaction(&self, other: &Self) -> bool {
        self.readonly_view().0 == other.readonly_view().0
    }
}

impl fmt::Debug for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateToken(0x{}..)", hex(&self.0[..4]))
    }
}

impl Write for StateToken {
    fn write(&self, writer: &mut impl BufMut) {
        writer.put_slice(&self.0);
    }
}

impl Read for StateToken {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        if reader.remaining() < TOKEN_LEN {
            return Err(Error::EndOfBuffer);
        }
        let mut bytes = [0u8; TOKEN_LEN];
        reader.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl FixedSize for StateToken {
    const SIZE: usize = TOKEN_LEN;
}

/// An unforgeable per-call token minted by the router.
///
/// Handlers receive it in their packet header and must present it on
/// nested requests; the router authenticates the real caller by looking up
/// the frame that owns the token, never by trusting callee-supplied data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken([u8; TOKEN_LEN]);

impl ContextToken {
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero token presented by external callers (no parent frame).
    pub fn zero() -> Self {
        Self([0u8; TOKEN_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; TOKEN_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextToken(0x{}..)", hex(&self.0[..4]))
    }
}

impl Write for ContextToken {
    fn write(&self, writer: &mut impl BufMut) {
        writer.put_slice(&self.0);
    }
}

impl Read for ContextToken {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        if reader.remaining() < TOKEN_LEN {
            return Err(Error::EndOfBuffer);
        }
        let mut bytes = [0u8; TOKEN_LEN];
        reader.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl FixedSize for ContextToken {
    const SIZE: usize = TOKEN_LEN;
}
