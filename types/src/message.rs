use crate::{
    address::Address,
    token::{ContextToken, StateToken},
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    varint::UInt, EncodeSize, Error, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_cryptography::{sha256::Sha256, Hasher};
use std::fmt;
use thiserror::Error;

/// Maximum length of a message name in bytes.
pub const MAX_MESSAGE_NAME_LEN: usize = 127;

/// Maximum length of a message payload accepted by the typed request codec.
pub const MAX_MESSAGE_DATA_LEN: usize = 1 << 20;

/// Prefix identifying module messages. Requests carrying such a name must
/// omit the target address; the registry resolves it.
pub const MODULE_MESSAGE_PREFIX: &str = "module:";

/// Reserved message invoked when an account is created.
pub const ON_CREATE: &str = "on_create";

/// Reserved message invoked on the new handler during migration.
pub const ON_MIGRATE: &str = "on_migrate";

/// Declared read/write capability of a message handler.
///
/// The lattice is strict: a handler may only call targets at or below its
/// own level (`Pure < Readonly < Volatile`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Volatility {
    /// No state access; may call only pure targets.
    Pure,
    /// May read state; may call readonly and pure targets.
    Readonly,
    /// May read and write state; may call anything.
    Volatile,
}

impl Volatility {
    /// Whether a handler at this level may call a target at `callee`'s level.
    pub fn may_call(self, callee: Volatility) -> bool {
        callee <= self
    }
}

impl fmt::Display for Volatility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure => write!(f, "pure"),
            Self::Readonly => write!(f, "readonly"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}

impl Write for Volatility {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Pure => 0u8.write(writer),
            Self::Readonly => 1u8.write(writer),
            Self::Volatile => 2u8.write(writer),
        }
    }
}

impl Read for Volatility {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Pure),
            1 => Ok(Self::Readonly),
            2 => Ok(Self::Volatile),
            kind => Err(Error::InvalidEnum(kind)),
        }
    }
}

impl FixedSize for Volatility {
    const SIZE: usize = 1;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("message name is empty")]
    Empty,
    #[error("message name is {0} bytes, the maximum is {MAX_MESSAGE_NAME_LEN}")]
    TooLong(usize),
    #[error("message name contains byte {0:#04x}")]
    InvalidCharacter(u8),
}

/// A validated message name: ASCII, non-empty, at most
/// [MAX_MESSAGE_NAME_LEN] bytes, restricted to letters, digits, and
/// `: _ / .`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageName(String);

impl MessageName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_MESSAGE_NAME_LEN {
            return Err(NameError::TooLong(name.len()));
        }
        for &byte in name.as_bytes() {
            let valid = byte.is_ascii_alphanumeric() || matches!(byte, b':' | b'_' | b'/' | b'.');
            if !valid {
                return Err(NameError::InvalidCharacter(byte));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this names a module message (registry-resolved target).
    pub fn is_module_message(&self) -> bool {
        self.0.starts_with(MODULE_MESSAGE_PREFIX)
    }

    /// The 8-byte name hash carried in packet headers: the first eight
    /// bytes of the SHA-256 of the name, big-endian.
    pub fn hash(&self) -> u64 {
        let digest = Sha256::hash(self.0.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_ref()[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for MessageName {
    fn write(&self, writer: &mut impl BufMut) {
        (self.0.len() as u8).write(writer);
        writer.put_slice(self.0.as_bytes());
    }
}

impl Read for MessageName {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let len = u8::read(reader)? as usize;
        if len > MAX_MESSAGE_NAME_LEN {
            return Err(Error::Invalid("MessageName", "length exceeds maximum"));
        }
        if reader.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let mut bytes = vec![0u8; len];
        reader.copy_to_slice(&mut bytes);
        let name = String::from_utf8(bytes)
            .map_err(|_| Error::Invalid("MessageName", "invalid UTF-8"))?;
        Self::new(name).map_err(|_| Error::Invalid("MessageName", "invalid name"))
    }
}

impl EncodeSize for MessageName {
    fn encode_size(&self) -> usize {
        1 + self.0.len()
    }
}

/// A typed message request as it enters the dispatch layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRequest {
    /// Target account. Empty for system lifecycle messages and module
    /// messages (the registry resolves the latter).
    pub target: Address,
    /// Claimed caller. Empty for queries. The router authenticates the
    /// real caller from the context token, never from this field alone.
    pub caller: Address,
    pub name: MessageName,
    pub data: Vec<u8>,
    pub state_token: StateToken,
    pub context: ContextToken,
    /// Gas limit for this call; zero inherits the caller's remaining limit
    /// (or runs unmetered at the external root).
    pub gas_limit: u64,
}

impl Write for MessageRequest {
    fn write(&self, writer: &mut impl BufMut) {
        self.target.write(writer);
        self.caller.write(writer);
        self.name.write(writer);
        self.data.write(writer);
        self.state_token.write(writer);
        self.context.write(writer);
        UInt(self.gas_limit).write(writer);
    }
}

impl Read for MessageRequest {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            target: Address::read(reader)?,
            caller: Address::read(reader)?,
            name: MessageName::read(reader)?,
            data: Vec::<u8>::read_range(reader, 0..=MAX_MESSAGE_DATA_LEN)?,
            state_token: StateToken::read(reader)?,
            context: ContextToken::read(reader)?,
            gas_limit: UInt::read(reader)?.into(),
        })
    }
}

impl EncodeSize for MessageRequest {
    fn encode_size(&self) -> usize {
        self.target.encode_size()
            + self.caller.encode_size()
            + self.name.encode_size()
            + self.data.encode_size()
            + self.state_token.encode_size()
            + self.context.encode_size()
            + UInt(self.gas_limit).encode_size()
    }
}

/// The typed response extracted from a completed dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageResponse {
    /// Primary output payload (the packet's first output pointer).
    pub data: Vec<u8>,
    /// Gas consumed by the call chain, as metered by the dispatch layer.
    pub gas_used: u64,
}
