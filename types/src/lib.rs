//! Common types shared between the cokernel hypervisor, its execution
//! environments, and the drivers that feed it.
//!
//! Everything that crosses an environment boundary lives here: addresses,
//! handler identities, message names, volatility, state/context tokens, and
//! the block-level request/response pair consumed by the optimistic
//! execution path. Wire forms implement the `commonware-codec` traits so
//! environments that do not share memory can exchange them byte-for-byte.

pub mod address;
pub mod block;
pub mod code;
pub mod handler;
pub mod message;
pub mod token;

pub use address::{Address, AddressError, MAX_ADDRESS_LEN};
pub use block::{BlockRequest, BlockResponse, TxResult, MAX_BLOCK_TRANSACTIONS};
pub use code::{ErrorCode, SystemCode};
pub use handler::{HandlerId, HandlerIdError, HandlerMetadata, MessageMetadata};
pub use message::{
    MessageName, MessageRequest, MessageResponse, NameError, Volatility, MAX_MESSAGE_NAME_LEN,
    MODULE_MESSAGE_PREFIX, ON_CREATE, ON_MIGRATE,
};
pub use token::{ContextToken, StateToken, TOKEN_LEN};
