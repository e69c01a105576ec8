use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Error, Read, ReadExt, Write};
use std::fmt;

/// A system-reserved error code (1..=255).
///
/// Codes in this range are owned by the dispatch layer; handlers may only
/// return one verbatim after receiving it from a nested call. Everything
/// above 255 is handler-defined and opaque to the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemCode(u8);

impl SystemCode {
    /// Gas limit exhausted; unwinds to the frame that imposed the limit.
    pub const OUT_OF_GAS: Self = Self(1);
    /// Unrecoverable failure; unwinds to the external root. The driver is
    /// expected to terminate the process rather than continue.
    pub const FATAL: Self = Self(2);
    /// No account is registered at the target address.
    pub const ACCOUNT_NOT_FOUND: Self = Self(3);
    /// The resolved handler does not declare the message name.
    pub const MESSAGE_NOT_FOUND: Self = Self(4);
    /// The request violates the volatility lattice.
    pub const VOLATILITY_VIOLATION: Self = Self(5);
    /// The claimed caller does not match the authenticated caller and no
    /// middleware approved the impersonation.
    pub const UNAUTHORIZED_CALLER: Self = Self(6);
    /// The handler (or the caller's request shape) violated the dispatch
    /// protocol.
    pub const INVALID_HANDLER: Self = Self(7);
    /// Buffer allocation failed while marshaling a packet.
    pub const ALLOCATION_FAILURE: Self = Self(8);

    /// Construct a system code from a raw value; zero is success, not a code.
    pub fn new(code: u8) -> Option<Self> {
        if code == 0 {
            return None;
        }
        Some(Self(code))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Whether this code forcibly pops frames instead of returning normally.
    pub fn is_unwinding(&self) -> bool {
        *self == Self::OUT_OF_GAS || *self == Self::FATAL
    }
}

impl fmt::Display for SystemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OUT_OF_GAS => write!(f, "out of gas"),
            Self::FATAL => write!(f, "fatal"),
            Self::ACCOUNT_NOT_FOUND => write!(f, "account not found"),
            Self::MESSAGE_NOT_FOUND => write!(f, "message not found"),
            Self::VOLATILITY_VIOLATION => write!(f, "volatility violation"),
            Self::UNAUTHORIZED_CALLER => write!(f, "unauthorized caller"),
            Self::INVALID_HANDLER => write!(f, "invalid handler"),
            Self::ALLOCATION_FAILURE => write!(f, "allocation failure"),
            Self(code) => write!(f, "system code {code}"),
        }
    }
}

/// A non-zero error code returned from a dispatch.
///
/// The zero value (success) is deliberately unrepresentable: dispatch
/// results are `Result<_, ErrorCode>`, never a raw integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Reserved system codes (1..=255).
    System(SystemCode),
    /// Handler-defined codes (>255), opaque to the dispatch layer.
    Handler(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => None,
            1..=255 => Some(Self::System(SystemCode(code as u8))),
            _ => Some(Self::Handler(code)),
        }
    }

    pub fn to_u32(&self) -> u32 {
        match self {
            Self::System(code) => code.get() as u32,
            Self::Handler(code) => *code,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    pub fn is_unwinding(&self) -> bool {
        matches!(self, Self::System(code) if code.is_unwinding())
    }
}

impl From<SystemCode> for ErrorCode {
    fn from(code: SystemCode) -> Self {
        Self::System(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System(code) => write!(f, "{code}"),
            Self::Handler(code) => write!(f, "handler code {code}"),
        }
    }
}

impl std::error::Error for ErrorCode {}

impl Write for ErrorCode {
    fn write(&self, writer: &mut impl BufMut) {
        UInt(self.to_u32()).write(writer);
    }
}

impl Read for ErrorCode {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let raw: u32 = UInt::read(reader)?.into();
        Self::from_u32(raw).ok_or(Error::Invalid("ErrorCode", "zero is not an error"))
    }
}

impl EncodeSize for ErrorCode {
    fn encode_size(&self) -> usize {
        UInt(self.to_u32()).encode_size()
    }
}
