use crate::message::{MessageName, Volatility};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, RangeCfg, Read, ReadExt, ReadRangeExt, Write};
use std::fmt;
use thiserror::Error;

/// Maximum length of either component of a handler identity.
pub const MAX_HANDLER_ID_COMPONENT_LEN: usize = 64;

/// Maximum number of messages a handler may declare.
pub const MAX_HANDLER_MESSAGES: usize = 256;

/// Maximum length of the opaque metadata byte fields.
pub const MAX_METADATA_BYTES: usize = 4096;

/// The reserved machine id that marks module handlers.
pub const MODULE_MACHINE_ID: &str = "module";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerIdError {
    #[error("handler id has no ':' separator")]
    MissingSeparator,
    #[error("handler id component is empty")]
    EmptyComponent,
    #[error("handler id component is {0} bytes, the maximum is {MAX_HANDLER_ID_COMPONENT_LEN}")]
    ComponentTooLong(usize),
    #[error("handler id component contains byte {0:#04x}")]
    InvalidCharacter(u8),
}

/// Identity of the code that runs for an account.
///
/// Two shapes exist: `module:<name>` for module handlers registered at
/// startup, and `<machine-id>:<machine-handler-id>` for handlers hosted by
/// an execution environment. Immutable per account; replaced wholesale on
/// migration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandlerId {
    /// A module handler, keyed by its globally-unique module name.
    Module(String),
    /// A handler hosted by a registered machine.
    Machine { machine: String, handler: String },
}

fn check_component(component: &str) -> Result<(), HandlerIdError> {
    if component.is_empty() {
        return Err(HandlerIdError::EmptyComponent);
    }
    if component.len() > MAX_HANDLER_ID_COMPONENT_LEN {
        return Err(HandlerIdError::ComponentTooLong(component.len()));
    }
    for &byte in component.as_bytes() {
        let valid = byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'/' | b'.' | b'-');
        if !valid {
            return Err(HandlerIdError::InvalidCharacter(byte));
        }
    }
    Ok(())
}

impl HandlerId {
    /// Parse the `<left>:<right>` string form.
    pub fn parse(raw: &str) -> Result<Self, HandlerIdError> {
        let (left, right) = raw
            .split_once(':')
            .ok_or(HandlerIdError::MissingSeparator)?;
        check_component(left)?;
        check_component(right)?;
        if left == MODULE_MACHINE_ID {
            return Ok(Self::Module(right.to_string()));
        }
        Ok(Self::Machine {
            machine: left.to_string(),
            handler: right.to_string(),
        })
    }

    /// A module handler id from a validated module name.
    pub fn module(name: &str) -> Result<Self, HandlerIdError> {
        check_component(name)?;
        Ok(Self::Module(name.to_string()))
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Self::Module(_))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(name) => write!(f, "{MODULE_MACHINE_ID}:{name}"),
            Self::Machine { machine, handler } => write!(f, "{machine}:{handler}"),
        }
    }
}

impl Write for HandlerId {
    fn write(&self, writer: &mut impl BufMut) {
        let raw = self.to_string();
        (raw.len() as u8).write(writer);
        writer.put_slice(raw.as_bytes());
    }
}

impl Read for HandlerId {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let len = u8::read(reader)? as usize;
        if reader.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let mut bytes = vec![0u8; len];
        reader.copy_to_slice(&mut bytes);
        let raw = String::from_utf8(bytes)
            .map_err(|_| Error::Invalid("HandlerId", "invalid UTF-8"))?;
        Self::parse(&raw).map_err(|_| Error::Invalid("HandlerId", "invalid handler id"))
    }
}

impl EncodeSize for HandlerId {
    fn encode_size(&self) -> usize {
        1 + self.to_string().len()
    }
}

/// Per-message declaration inside a handler's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub name: MessageName,
    pub volatility: Volatility,
    /// Opaque bytes for environment-specific use.
    pub extra: Vec<u8>,
}

impl Write for MessageMetadata {
    fn write(&self, writer: &mut impl BufMut) {
        self.name.write(writer);
        self.volatility.write(writer);
        self.extra.write(writer);
    }
}

impl Read for MessageMetadata {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            name: MessageName::read(reader)?,
            volatility: Volatility::read(reader)?,
            extra: Vec::<u8>::read_range(reader, 0..=MAX_METADATA_BYTES)?,
        })
    }
}

impl EncodeSize for MessageMetadata {
    fn encode_size(&self) -> usize {
        self.name.encode_size() + self.volatility.encode_size() + self.extra.encode_size()
    }
}

/// Immutable description of a handler version: the messages it serves (with
/// their volatility), the storage configuration handed to the state manager
/// at account creation, and opaque extra bytes.
///
/// Queried before every dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerMetadata {
    pub messages: Vec<MessageMetadata>,
    pub state_config: Vec<u8>,
    pub extra: Vec<u8>,
}

impl HandlerMetadata {
    /// The declared volatility of a message, if the handler serves it.
    pub fn volatility_of(&self, name: &MessageName) -> Option<Volatility> {
        self.messages
            .iter()
            .find(|message| message.name == *name)
            .map(|message| message.volatility)
    }

    pub fn serves(&self, name: &MessageName) -> bool {
        self.volatility_of(name).is_some()
    }
}

impl Write for HandlerMetadata {
    fn write(&self, writer: &mut impl BufMut) {
        self.messages.write(writer);
        self.state_config.write(writer);
        self.extra.write(writer);
    }
}

impl Read for HandlerMetadata {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            messages: Vec::<MessageMetadata>::read_cfg(
                reader,
                &(RangeCfg::from(0..=MAX_HANDLER_MESSAGES), ()),
            )?,
            state_config: Vec::<u8>::read_range(reader, 0..=MAX_METADATA_BYTES)?,
            extra: Vec::<u8>::read_range(reader, 0..=MAX_METADATA_BYTES)?,
        })
    }
}

impl EncodeSize for HandlerMetadata {
    fn encode_size(&self) -> usize {
        self.messages.encode_size() + self.state_config.encode_size() + self.extra.encode_size()
    }
}
