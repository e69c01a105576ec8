use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_utils::hex;
use std::fmt;
use thiserror::Error;

/// Maximum length of an account address in bytes.
pub const MAX_ADDRESS_LEN: usize = 63;

/// A variable-length account address (0 to [MAX_ADDRESS_LEN] bytes).
///
/// The empty address is the system address: it never identifies a live
/// account and is used as the target of lifecycle messages and as the
/// caller of externally-originated queries. Addresses are never recycled
/// while an account is live.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Vec<u8>);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is {0} bytes, the maximum is {MAX_ADDRESS_LEN}")]
    TooLong(usize),
}

impl Address {
    /// Create an address from raw bytes, rejecting oversized input.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, AddressError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// The empty system address.
    pub fn system() -> Self {
        Self(Vec::new())
    }

    pub fn is_system(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

impl Write for Address {
    fn write(&self, writer: &mut impl BufMut) {
        (self.0.len() as u8).write(writer);
        writer.put_slice(&self.0);
    }
}

impl Read for Address {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let len = u8::read(reader)? as usize;
        if len > MAX_ADDRESS_LEN {
            return Err(Error::Invalid("Address", "length exceeds maximum"));
        }
        if reader.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let mut bytes = vec![0u8; len];
        reader.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl EncodeSize for Address {
    fn encode_size(&self) -> usize {
        1 + self.0.len()
    }
}
