use cokernel_types::{Address, ContextToken, MessageName, StateToken, TOKEN_LEN};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 512;

/// Maximum bytes of a system diagnostic written into output pointer 1.
pub const MAX_DIAGNOSTIC_LEN: usize = 255;

// Header field offsets. Integers are big-endian; name and address fields
// are a length byte followed by the bytes, zero-padded to the field width.
const NAME_HASH_OFFSET: usize = 0;
const GAS_LIMIT_OFFSET: usize = 8;
const GAS_CONSUMED_OFFSET: usize = 16;
const NAME_OFFSET: usize = 24;
const NAME_FIELD: usize = 128;
const TARGET_OFFSET: usize = 152;
const CALLER_OFFSET: usize = 216;
const ADDRESS_FIELD: usize = 64;
const STATE_TOKEN_OFFSET: usize = 280;
const CONTEXT_TOKEN_OFFSET: usize = 312;
const POINTERS_OFFSET: usize = 344;
const POINTER_FIELD: usize = 16;

/// Byte range of the four pointer fields, the only header region that is
/// allowed to differ after a marshaling round trip.
pub const POINTER_REGION: std::ops::Range<usize> =
    POINTERS_OFFSET..POINTERS_OFFSET + 4 * POINTER_FIELD;

/// The four data-pointer slots of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerSlot {
    Input1,
    Input2,
    Output1,
    Output2,
}

impl PointerSlot {
    pub const INPUTS: [Self; 2] = [Self::Input1, Self::Input2];
    pub const OUTPUTS: [Self; 2] = [Self::Output1, Self::Output2];

    fn index(self) -> usize {
        match self {
            Self::Input1 => 0,
            Self::Input2 => 1,
            Self::Output1 => 2,
            Self::Output2 => 3,
        }
    }

    fn offset(self) -> usize {
        POINTERS_OFFSET + self.index() * POINTER_FIELD
    }

    pub fn is_output(self) -> bool {
        matches!(self, Self::Output1 | Self::Output2)
    }
}

/// Wire form of a data pointer: a native pointer (or zero), a length, and
/// a third word that is the buffer capacity for native pointers or an
/// in-packet offset for local data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataPointer {
    pub pointer: u64,
    pub len: u32,
    pub capacity_or_offset: u32,
}

impl DataPointer {
    pub fn is_native(&self) -> bool {
        self.pointer != 0
    }

    pub fn encode(&self, field: &mut [u8]) {
        field[..8].copy_from_slice(&self.pointer.to_be_bytes());
        field[8..12].copy_from_slice(&self.len.to_be_bytes());
        field[12..16].copy_from_slice(&self.capacity_or_offset.to_be_bytes());
    }

    pub fn decode(field: &[u8]) -> Self {
        Self {
            pointer: u64::from_be_bytes(field[..8].try_into().expect("pointer field")),
            len: u32::from_be_bytes(field[8..12].try_into().expect("length field")),
            capacity_or_offset: u32::from_be_bytes(field[12..16].try_into().expect("capacity field")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum Payload {
    #[default]
    Empty,
    /// Data inside the packet buffer, at `offset` (at or after the header).
    Inline { offset: u32, len: u32 },
    /// An out-of-line buffer owned by this packet. `taken` flips once the
    /// responsible party claims the buffer; a taken slot reads as empty and
    /// can never be claimed twice.
    Owned { data: Vec<u8>, taken: bool },
}

/// The fixed-layout envelope passed across environment boundaries.
///
/// The packet owns its header buffer, any inline payload appended after the
/// header, and any out-of-line buffers its pointers reference. Foreign
/// environments never observe Rust references: the marshaling layer copies
/// payloads explicitly (see [crate::marshal]).
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePacket {
    buf: Vec<u8>,
    payloads: [Payload; 4],
}

fn write_prefixed(buf: &mut [u8], offset: usize, field: usize, bytes: &[u8]) {
    debug_assert!(bytes.len() < field);
    buf[offset] = bytes.len() as u8;
    buf[offset + 1..offset + 1 + bytes.len()].copy_from_slice(bytes);
    for byte in &mut buf[offset + 1 + bytes.len()..offset + field] {
        *byte = 0;
    }
}

fn read_prefixed(buf: &[u8], offset: usize, field: usize) -> Option<&[u8]> {
    let len = buf[offset] as usize;
    if len >= field {
        return None;
    }
    Some(&buf[offset + 1..offset + 1 + len])
}

impl MessagePacket {
    /// Build a request packet with empty pointers.
    pub fn new(
        name: &MessageName,
        target: &Address,
        caller: &Address,
        state_token: StateToken,
        context: ContextToken,
        gas_limit: u64,
    ) -> Self {
        let mut packet = Self {
            buf: vec![0u8; HEADER_SIZE],
            payloads: Default::default(),
        };
        packet.set_name(name);
        packet.set_target(target);
        packet.set_caller(caller);
        packet.set_state_token(state_token);
        packet.set_context_token(context);
        packet.set_gas_limit(gas_limit);
        packet
    }

    pub(crate) fn from_parts(buf: Vec<u8>, payloads: [Payload; 4]) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Self { buf, payloads }
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn payload(&self, slot: PointerSlot) -> &Payload {
        &self.payloads[slot.index()]
    }

    pub(crate) fn set_payload(&mut self, slot: PointerSlot, payload: Payload) {
        self.payloads[slot.index()] = payload;
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_be_bytes(self.buf[offset..offset + 8].try_into().expect("u64 field"))
    }

    fn set_u64_at(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn name_hash(&self) -> u64 {
        self.u64_at(NAME_HASH_OFFSET)
    }

    pub fn gas_limit(&self) -> u64 {
        self.u64_at(GAS_LIMIT_OFFSET)
    }

    pub fn set_gas_limit(&mut self, limit: u64) {
        self.set_u64_at(GAS_LIMIT_OFFSET, limit);
    }

    pub fn gas_consumed(&self) -> u64 {
        self.u64_at(GAS_CONSUMED_OFFSET)
    }

    pub fn set_gas_consumed(&mut self, consumed: u64) {
        self.set_u64_at(GAS_CONSUMED_OFFSET, consumed);
    }

    /// Add handler-reported gas to the consumed field.
    pub fn consume_gas(&mut self, amount: u64) {
        let consumed = self.gas_consumed().saturating_add(amount);
        self.set_gas_consumed(consumed);
    }

    /// The message name, if the header carries a valid one.
    pub fn name(&self) -> Option<MessageName> {
        let bytes = read_prefixed(&self.buf, NAME_OFFSET, NAME_FIELD)?;
        let name = std::str::from_utf8(bytes).ok()?;
        MessageName::new(name).ok()
    }

    pub fn set_name(&mut self, name: &MessageName) {
        self.set_u64_at(NAME_HASH_OFFSET, name.hash());
        write_prefixed(&mut self.buf, NAME_OFFSET, NAME_FIELD, name.as_str().as_bytes());
    }

    pub fn target(&self) -> Option<Address> {
        let bytes = read_prefixed(&self.buf, TARGET_OFFSET, ADDRESS_FIELD)?;
        Address::new(bytes.to_vec()).ok()
    }

    pub fn set_target(&mut self, target: &Address) {
        write_prefixed(&mut self.buf, TARGET_OFFSET, ADDRESS_FIELD, target.as_bytes());
    }

    pub fn caller(&self) -> Option<Address> {
        let bytes = read_prefixed(&self.buf, CALLER_OFFSET, ADDRESS_FIELD)?;
        Address::new(bytes.to_vec()).ok()
    }

    pub fn set_caller(&mut self, caller: &Address) {
        write_prefixed(&mut self.buf, CALLER_OFFSET, ADDRESS_FIELD, caller.as_bytes());
    }

    pub fn state_token(&self) -> StateToken {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes.copy_from_slice(&self.buf[STATE_TOKEN_OFFSET..STATE_TOKEN_OFFSET + TOKEN_LEN]);
        StateToken::from_bytes(bytes)
    }

    pub fn set_state_token(&mut self, token: StateToken) {
        self.buf[STATE_TOKEN_OFFSET..STATE_TOKEN_OFFSET + TOKEN_LEN]
            .copy_from_slice(token.as_bytes());
    }

    pub fn context_token(&self) -> ContextToken {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes.copy_from_slice(&self.buf[CONTEXT_TOKEN_OFFSET..CONTEXT_TOKEN_OFFSET + TOKEN_LEN]);
        ContextToken::from_bytes(bytes)
    }

    pub fn set_context_token(&mut self, token: ContextToken) {
        self.buf[CONTEXT_TOKEN_OFFSET..CONTEXT_TOKEN_OFFSET + TOKEN_LEN]
            .copy_from_slice(token.as_bytes());
    }

    /// Attach an input payload as an out-of-line buffer owned by this
    /// packet.
    pub fn set_input(&mut self, slot: PointerSlot, data: &[u8]) {
        debug_assert!(!slot.is_output());
        self.payloads[slot.index()] = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Owned {
                data: data.to_vec(),
                taken: false,
            }
        };
    }

    /// Append an input payload to the packet buffer itself (local data,
    /// referenced by offset rather than by native pointer).
    pub fn set_input_inline(&mut self, slot: PointerSlot, data: &[u8]) {
        debug_assert!(!slot.is_output());
        if data.is_empty() {
            self.payloads[slot.index()] = Payload::Empty;
            return;
        }
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(data);
        self.payloads[slot.index()] = Payload::Inline {
            offset,
            len: data.len() as u32,
        };
    }

    /// The bytes an input pointer references (empty for unset slots).
    pub fn input(&self, slot: PointerSlot) -> &[u8] {
        self.payload_bytes(slot).unwrap_or(&[])
    }

    /// Fill an output slot. Callees use this; zero-length outputs remain
    /// placeholders.
    pub fn set_output(&mut self, slot: PointerSlot, data: Vec<u8>) {
        debug_assert!(slot.is_output());
        self.payloads[slot.index()] = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Owned { data, taken: false }
        };
    }

    /// The bytes an output pointer references, if the slot is filled and
    /// not yet taken.
    pub fn output(&self, slot: PointerSlot) -> Option<&[u8]> {
        self.payload_bytes(slot)
    }

    /// Claim ownership of an output buffer. The slot is marked taken:
    /// a second take returns `None` and the packet will no longer free the
    /// buffer, so exactly one party deallocates it.
    pub fn take_output(&mut self, slot: PointerSlot) -> Option<Vec<u8>> {
        debug_assert!(slot.is_output());
        match &mut self.payloads[slot.index()] {
            Payload::Owned { data, taken } if !*taken => {
                *taken = true;
                Some(std::mem::take(data))
            }
            _ => None,
        }
    }

    fn payload_bytes(&self, slot: PointerSlot) -> Option<&[u8]> {
        match &self.payloads[slot.index()] {
            Payload::Empty => None,
            Payload::Inline { offset, len } => {
                let start = *offset as usize;
                self.buf.get(start..start + *len as usize)
            }
            Payload::Owned { taken: true, .. } => None,
            Payload::Owned { data, .. } => Some(data),
        }
    }

    /// The wire form of a pointer slot at this moment. Owned buffers
    /// expose their current native address and capacity; inline data its
    /// in-packet offset.
    pub fn pointer(&self, slot: PointerSlot) -> DataPointer {
        match &self.payloads[slot.index()] {
            Payload::Empty | Payload::Owned { taken: true, .. } => DataPointer::default(),
            Payload::Inline { offset, len } => DataPointer {
                pointer: 0,
                len: *len,
                capacity_or_offset: *offset,
            },
            Payload::Owned { data, .. } => DataPointer {
                pointer: data.as_ptr() as u64,
                len: data.len() as u32,
                capacity_or_offset: data.capacity() as u32,
            },
        }
    }

    /// Render the full 512-byte header, including current pointer fields.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buf[..HEADER_SIZE]);
        for slot in [
            PointerSlot::Input1,
            PointerSlot::Input2,
            PointerSlot::Output1,
            PointerSlot::Output2,
        ] {
            let offset = slot.offset();
            self.pointer(slot)
                .encode(&mut header[offset..offset + POINTER_FIELD]);
        }
        header
    }

    /// Write a terminal diagnostic for the external driver into output
    /// pointer 1, truncated to [MAX_DIAGNOSTIC_LEN] bytes.
    pub fn write_diagnostic(&mut self, message: &str) {
        let mut bytes = message.as_bytes();
        if bytes.len() > MAX_DIAGNOSTIC_LEN {
            bytes = &bytes[..MAX_DIAGNOSTIC_LEN];
        }
        self.set_output(PointerSlot::Output1, bytes.to_vec());
    }
}
