//! Cokernel hypervisor: a cross-environment account/module execution
//! engine.
//!
//! The router dispatches typed messages between independently-implemented
//! execution environments (native modules, sandboxed machines), enforces a
//! transactional state-access discipline through the storage layer's
//! transaction manager, meters computational cost, and speculatively
//! executes block finalization ahead of agreement with safe cancellation.
//!
//! ## Determinism requirements
//! - Dispatch is synchronous and single-path: control returns to the
//!   external caller only after the call tree committed, rolled back, or
//!   unwound.
//! - Context tokens are minted from the router's own generator; fix
//!   [config::Config::token_seed] to make them reproducible under test.
//! - The only background concurrency is the optimistic scheduler, and at
//!   most one speculative run exists at a time.
//!
//! The primary entrypoints are [router::Hypervisor] and
//! [scheduler::Optimistic].

pub mod config;
pub mod gas;
pub mod machine;
pub mod marshal;
pub mod packet;
pub mod policy;
pub mod router;
pub mod scheduler;
pub mod state;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod dispatch_tests;


#[cfg(test)]
mod scheduler_tests;

pub use config::{AddressScheme, Config};
pub use gas::GasMeter;
pub use machine::{Handler, Host, Machine};
pub use marshal::{Allocator, HostAllocator, MarshalError};
pub use packet::{DataPointer, MessagePacket, PointerSlot, HEADER_SIZE, MAX_DIAGNOSTIC_LEN};
pub use policy::Authorizer;
pub use router::{
    packet_from_request, BuildError, Builder, Hypervisor, Phase, MSG_CREATE, MSG_DESTROY,
    MSG_FORCE_MIGRATE, MSG_MIGRATE,
};
pub use scheduler::{Finalize, FinalizeOutput, Interrupt, Optimistic, SchedulerError};
pub use state::StateManager;
