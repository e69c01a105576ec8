//! Copying message packets across environment boundaries.
//!
//! When an environment shares memory with the router, packets are lent by
//! reference and the pointer fields alias live buffers. When it does not,
//! the request is copied into the target environment through its allocator
//! and the outputs are copied back afterwards. Both directions are
//! all-or-nothing: an allocation failure surfaces as an error and never a
//! partially-filled packet.

use crate::packet::{MessagePacket, Payload, PointerSlot};
use cokernel_types::{ErrorCode, SystemCode};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarshalError {
    #[error("failed to allocate {0} bytes")]
    Alloc(usize),
}

impl From<MarshalError> for ErrorCode {
    fn from(_: MarshalError) -> Self {
        ErrorCode::System(SystemCode::ALLOCATION_FAILURE)
    }
}

/// Buffer allocation inside one environment's memory.
///
/// Allocation is fallible by contract: environments meter their memory and
/// marshaling must stay correct under exhaustion.
pub trait Allocator {
    /// Allocate a zeroed buffer of exactly `len` bytes.
    fn alloc(&self, len: usize) -> Result<Vec<u8>, MarshalError>;
}

/// The router's own allocator (plain heap, failure reported rather than
/// aborting).
pub struct HostAllocator;

impl Allocator for HostAllocator {
    fn alloc(&self, len: usize) -> Result<Vec<u8>, MarshalError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| MarshalError::Alloc(len))?;
        buf.resize(len, 0);
        Ok(buf)
    }
}

/// Copy a request into a target environment.
///
/// The packet buffer (header plus any local payload region) is copied
/// verbatim, so local offsets stay reachable; every out-of-line input is
/// re-allocated in the target environment and its pointer rewritten.
/// Output slots remain placeholders for the callee to fill.
pub fn copy_request<A: Allocator + ?Sized>(
    source: &MessagePacket,
    target: &A,
) -> Result<MessagePacket, MarshalError> {
    let mut buf = target.alloc(source.buf().len())?;
    buf.copy_from_slice(source.buf());

    let mut payloads: [Payload; 4] = Default::default();
    for (index, slot) in PointerSlot::INPUTS.into_iter().enumerate() {
        payloads[index] = match source.payload(slot) {
            Payload::Empty | Payload::Owned { taken: true, .. } => Payload::Empty,
            Payload::Inline { offset, len } => Payload::Inline {
                offset: *offset,
                len: *len,
            },
            Payload::Owned { data, .. } => {
                let mut copy = target.alloc(data.len())?;
                copy.copy_from_slice(data);
                Payload::Owned {
                    data: copy,
                    taken: false,
                }
            }
        };
    }

    Ok(MessagePacket::from_parts(buf, payloads))
}

/// Copy a completed execution's outputs (and reported gas) back into the
/// source packet, allocating the buffers from the source environment.
///
/// The source packet owns the copied-back buffers until the caller claims
/// them with [MessagePacket::take_output]. Both outputs are allocated
/// before either is installed, so a failure leaves the source untouched.
pub fn copy_response<A: Allocator + ?Sized>(
    source: &mut MessagePacket,
    executed: &MessagePacket,
    source_alloc: &A,
) -> Result<(), MarshalError> {
    let mut copied: [Option<Vec<u8>>; 2] = [None, None];
    for (index, slot) in PointerSlot::OUTPUTS.into_iter().enumerate() {
        if let Some(bytes) = executed.output(slot) {
            let mut copy = source_alloc.alloc(bytes.len())?;
            copy.copy_from_slice(bytes);
            copied[index] = Some(copy);
        }
    }

    for (index, slot) in PointerSlot::OUTPUTS.into_iter().enumerate() {
        if let Some(data) = copied[index].take() {
            source.set_payload(slot, Payload::Owned { data, taken: false });
        }
    }
    source.set_gas_consumed(executed.gas_consumed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DataPointer, POINTER_REGION};
    use cokernel_types::{Address, ContextToken, MessageName, StateToken};
    use std::cell::Cell;

    /// Allocator with a byte quota, for exhaustion tests.
    struct QuotaAllocator {
        remaining: Cell<usize>,
    }

    impl QuotaAllocator {
        fn new(quota: usize) -> Self {
            Self {
                remaining: Cell::new(quota),
            }
        }
    }

    impl Allocator for QuotaAllocator {
        fn alloc(&self, len: usize) -> Result<Vec<u8>, MarshalError> {
            if len > self.remaining.get() {
                return Err(MarshalError::Alloc(len));
            }
            self.remaining.set(self.remaining.get() - len);
            Ok(vec![0u8; len])
        }
    }

    fn request() -> MessagePacket {
        let mut token = [0u8; 32];
        token[0] = 0x80;
        token[5] = 0x11;
        let mut packet = MessagePacket::new(
            &MessageName::new("transfer").unwrap(),
            &Address::new(vec![1; 4]).unwrap(),
            &Address::new(vec![2; 4]).unwrap(),
            StateToken::from_bytes(token),
            ContextToken::from_bytes([9u8; 32]),
            77_000,
        );
        packet.set_input(PointerSlot::Input1, b"native payload");
        packet.set_input_inline(PointerSlot::Input2, b"inline payload");
        packet
    }

    fn headers_match_except_pointers(a: &MessagePacket, b: &MessagePacket) -> bool {
        let (a, b) = (a.header_bytes(), b.header_bytes());
        let mut equal = true;
        for index in 0..a.len() {
            if POINTER_REGION.contains(&index) {
                continue;
            }
            equal &= a[index] == b[index];
        }
        equal
    }

    #[test]
    fn test_round_trip_preserves_header_and_payloads() {
        let mut source = request();
        let foreign = HostAllocator;

        // Into the foreign environment.
        let mut executed = copy_request(&source, &foreign).unwrap();
        assert!(headers_match_except_pointers(&source, &executed));
        assert_eq!(executed.input(PointerSlot::Input1), b"native payload");
        assert_eq!(executed.input(PointerSlot::Input2), b"inline payload");

        // The callee fills outputs and reports gas.
        executed.set_output(PointerSlot::Output1, b"ok".to_vec());
        executed.set_output(PointerSlot::Output2, b"aux".to_vec());
        executed.set_gas_consumed(1_234);

        // Back out again.
        copy_response(&mut source, &executed, &HostAllocator).unwrap();
        assert_eq!(source.output(PointerSlot::Output1).unwrap(), b"ok");
        assert_eq!(source.output(PointerSlot::Output2).unwrap(), b"aux");
        assert_eq!(source.gas_consumed(), 1_234);
        assert!(headers_match_except_pointers(&source, &executed));
    }

    #[test]
    fn test_native_inputs_are_reallocated() {
        let source = request();
        let copy = copy_request(&source, &HostAllocator).unwrap();
        let original = source.pointer(PointerSlot::Input1);
        let rewritten = copy.pointer(PointerSlot::Input1);
        assert!(original.is_native() && rewritten.is_native());
        assert_ne!(original.pointer, rewritten.pointer);
        assert_eq!(original.len, rewritten.len);
    }

    #[test]
    fn test_request_allocation_failure_is_total() {
        let source = request();
        // Enough for the packet buffer, not for the out-of-line input.
        let stingy = QuotaAllocator::new(source.buf().len() + 4);
        assert_eq!(
            copy_request(&source, &stingy),
            Err(MarshalError::Alloc(14))
        );
    }

    #[test]
    fn test_response_allocation_failure_leaves_source_untouched() {
        let mut source = request();
        let mut executed = copy_request(&source, &HostAllocator).unwrap();
        executed.set_output(PointerSlot::Output1, vec![1; 8]);
        executed.set_output(PointerSlot::Output2, vec![2; 100]);
        executed.set_gas_consumed(55);

        // Quota covers the first output only; the copy must fail whole.
        let stingy = QuotaAllocator::new(16);
        assert_eq!(
            copy_response(&mut source, &executed, &stingy),
            Err(MarshalError::Alloc(100))
        );
        assert!(source.output(PointerSlot::Output1).is_none());
        assert!(source.output(PointerSlot::Output2).is_none());
        assert_eq!(source.gas_consumed(), 0);
    }

    #[test]
    fn test_taken_outputs_do_not_copy_back() {
        let mut source = request();
        let mut executed = copy_request(&source, &HostAllocator).unwrap();
        executed.set_output(PointerSlot::Output1, b"claimed".to_vec());
        let _ = executed.take_output(PointerSlot::Output1);

        copy_response(&mut source, &executed, &HostAllocator).unwrap();
        assert!(source.output(PointerSlot::Output1).is_none());
        assert_eq!(source.pointer(PointerSlot::Output1), DataPointer::default());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use cokernel_types::{Address, ContextToken, MessageName, StateToken};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trip_preserves_arbitrary_payloads(
            input1 in proptest::collection::vec(any::<u8>(), 1..512),
            input2 in proptest::collection::vec(any::<u8>(), 1..512),
            output in proptest::collection::vec(any::<u8>(), 1..512),
            gas in 1u64..u64::MAX,
        ) {
            let mut source = MessagePacket::new(
                &MessageName::new("roundtrip").unwrap(),
                &Address::new(vec![7; 8]).unwrap(),
                &Address::new(vec![8; 8]).unwrap(),
                StateToken::zero(),
                ContextToken::zero(),
                gas,
            );
            source.set_input(PointerSlot::Input1, &input1);
            source.set_input_inline(PointerSlot::Input2, &input2);

            let mut executed = copy_request(&source, &HostAllocator).unwrap();
            prop_assert_eq!(executed.input(PointerSlot::Input1), input1.as_slice());
            prop_assert_eq!(executed.input(PointerSlot::Input2), input2.as_slice());

            executed.set_output(PointerSlot::Output1, output.clone());
            copy_response(&mut source, &executed, &HostAllocator).unwrap();
            prop_assert_eq!(source.output(PointerSlot::Output1).unwrap(), output.as_slice());
        }
    }
}
