use crate::{marshal::Allocator, packet::MessagePacket};
use cokernel_types::{ErrorCode, HandlerMetadata};
use std::sync::Arc;

/// Callback handed to executing handlers for issuing nested requests back
/// through the router.
///
/// The packet's context token must be the one the handler received in its
/// own header; the router authenticates the real caller from it.
pub trait Host {
    fn invoke(&mut self, packet: &mut MessagePacket) -> Result<(), ErrorCode>;
}

/// Code that processes messages for an account or module.
///
/// Handlers report gas they burn themselves through the packet's
/// gas-consumed field; the dispatch layer adds its own metering on top.
pub trait Handler: Send + Sync {
    /// Immutable description of the messages this handler serves. Queried
    /// before every dispatch.
    fn metadata(&self) -> HandlerMetadata;

    /// Process one message. Output payloads go into the packet's output
    /// pointers; a non-zero return code must be either handler-defined
    /// (>255) or a system code received verbatim from a nested call.
    fn handle(&self, packet: &mut MessagePacket, host: &mut dyn Host) -> Result<(), ErrorCode>;
}

/// An execution environment hosting handlers (a VM adapter).
pub trait Machine: Send + Sync {
    /// Handler ids this environment can load.
    fn handlers(&self) -> Vec<String>;

    /// Load a handler by its environment-scoped id.
    fn load(&self, handler: &str) -> Option<Arc<dyn Handler>>;

    /// Metadata for a handler without necessarily loading it.
    fn metadata_for(&self, handler: &str) -> Option<HandlerMetadata> {
        self.load(handler).map(|handler| handler.metadata())
    }

    /// Environments that do not share memory with the router return their
    /// allocator here; the router then marshals packets across the
    /// boundary instead of lending them.
    fn allocator(&self) -> Option<&dyn Allocator> {
        None
    }
}
