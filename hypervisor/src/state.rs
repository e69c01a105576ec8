use anyhow::Result;
use cokernel_types::{Address, StateToken};

/// The transaction-manager contract implemented by the storage layer.
///
/// The hypervisor is the only caller. Tokens are opaque here beyond their
/// volatility bit: the storage layer decides what the remaining bits mean
/// and how nested sub-transactions derive from a parent token.
///
/// A failure from any of these methods is treated as unrecoverable by the
/// dispatch layer (storage loss mid-transaction cannot be reasoned about)
/// and surfaces as a fatal unwinding error.
pub trait StateManager {
    /// Initialize storage for a new account using the handler's declared
    /// state configuration.
    fn create(&mut self, address: &Address, state_config: &[u8]) -> Result<()>;

    /// Re-shape an existing account's storage for a new handler version.
    fn migrate(&mut self, address: &Address, new_state_config: &[u8]) -> Result<()>;

    /// Tear down an account's storage.
    fn destroy(&mut self, address: &Address) -> Result<()>;

    /// Open a nested transaction on `token` for a frame executing as
    /// `address`.
    fn begin_tx(&mut self, token: &StateToken, address: &Address) -> Result<()>;

    /// Commit the innermost transaction opened on `token`.
    fn commit_tx(&mut self, token: &StateToken) -> Result<()>;

    /// Roll back the innermost transaction opened on `token`.
    fn rollback_tx(&mut self, token: &StateToken) -> Result<()>;

    /// Drop all bookkeeping for a token that was newly introduced by a
    /// frame popped during unwinding. Must not fail: unwinding cannot be
    /// interrupted.
    fn discard_cleanup(&mut self, token: &StateToken);
}
