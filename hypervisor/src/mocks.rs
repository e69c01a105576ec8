//! Test doubles for the hypervisor: an in-memory transaction manager with
//! an operation journal, scripted handlers and machines, and finalize
//! stubs for the optimistic scheduler. Also used by downstream simulators
//! (enable the `mocks` feature).

use crate::{
    machine::{Handler, Host, Machine},
    marshal::{Allocator, HostAllocator},
    packet::MessagePacket,
    router::Hypervisor,
    scheduler::{Finalize, FinalizeOutput, Interrupt},
    state::StateManager,
};
use anyhow::{bail, Result};
use cokernel_types::{
    Address, BlockRequest, BlockResponse, ContextToken, ErrorCode, HandlerMetadata,
    MessageMetadata, MessageName, MessageRequest, StateToken, TxResult, Volatility, TOKEN_LEN,
};
use futures::{channel::oneshot, future::Shared, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handler-defined code a cooperative finalize returns when it observes
/// cancellation at one of its own check points.
pub const INTERRUPTED_CODE: u32 = 4096;

/// Every call the hypervisor makes into the transaction manager, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateOp {
    Create(Address),
    Migrate(Address),
    Destroy(Address),
    Begin(StateToken, Address),
    Commit(StateToken),
    Rollback(StateToken),
    Discard(StateToken),
}

#[derive(Default)]
pub struct MemoryState {
    pub accounts: HashMap<Address, Vec<u8>>,
    pub journal: Vec<StateOp>,
}

/// Cloneable handle over [MemoryState] so tests keep inspecting the
/// journal after the hypervisor takes ownership.
#[derive(Clone, Default)]
pub struct SharedState(pub Arc<Mutex<MemoryState>>);

impl SharedState {
    pub fn journal(&self) -> Vec<StateOp> {
        self.0.lock().unwrap().journal.clone()
    }

    pub fn has_account(&self, address: &Address) -> bool {
        self.0.lock().unwrap().accounts.contains_key(address)
    }

    pub fn count(&self, op: impl Fn(&StateOp) -> bool) -> usize {
        self.0.lock().unwrap().journal.iter().filter(|o| op(o)).count()
    }
}

impl StateManager for SharedState {
    fn create(&mut self, address: &Address, state_config: &[u8]) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.accounts.contains_key(address) {
            bail!("account {address} already exists");
        }
        state.accounts.insert(address.clone(), state_config.to_vec());
        state.journal.push(StateOp::Create(address.clone()));
        Ok(())
    }

    fn migrate(&mut self, address: &Address, new_state_config: &[u8]) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if !state.accounts.contains_key(address) {
            bail!("account {address} does not exist");
        }
        state
            .accounts
            .insert(address.clone(), new_state_config.to_vec());
        state.journal.push(StateOp::Migrate(address.clone()));
        Ok(())
    }

    fn destroy(&mut self, address: &Address) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.accounts.remove(address).is_none() {
            bail!("account {address} does not exist");
        }
        state.journal.push(StateOp::Destroy(address.clone()));
        Ok(())
    }

    fn begin_tx(&mut self, token: &StateToken, address: &Address) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.journal.push(StateOp::Begin(*token, address.clone()));
        Ok(())
    }

    fn commit_tx(&mut self, token: &StateToken) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.journal.push(StateOp::Commit(*token));
        Ok(())
    }

    fn rollback_tx(&mut self, token: &StateToken) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.journal.push(StateOp::Rollback(*token));
        Ok(())
    }

    fn discard_cleanup(&mut self, token: &StateToken) {
        let mut state = self.0.lock().unwrap();
        state.journal.push(StateOp::Discard(*token));
    }
}

/// A volatile state token whose opaque remainder carries `id`.
pub fn volatile_token(id: u8) -> StateToken {
    let mut bytes = [0u8; TOKEN_LEN];
    bytes[0] = 0x80;
    bytes[1] = id;
    StateToken::from_bytes(bytes)
}

/// A readonly state token whose opaque remainder carries `id`.
pub fn readonly_token(id: u8) -> StateToken {
    let mut bytes = [0u8; TOKEN_LEN];
    bytes[1] = id;
    StateToken::from_bytes(bytes)
}

/// Handler metadata from `(message, volatility)` pairs.
pub fn metadata(messages: &[(&str, Volatility)]) -> HandlerMetadata {
    HandlerMetadata {
        messages: messages
            .iter()
            .map(|(name, volatility)| MessageMetadata {
                name: MessageName::new(*name).expect("test message names are valid"),
                volatility: *volatility,
                extra: Vec::new(),
            })
            .collect(),
        state_config: b"cfg".to_vec(),
        extra: Vec::new(),
    }
}

type HandleFn = dyn Fn(&mut MessagePacket, &mut dyn Host) -> Result<(), ErrorCode> + Send + Sync;

/// A handler scripted with a closure.
pub struct ScriptedHandler {
    metadata: HandlerMetadata,
    handle: Box<HandleFn>,
}

impl ScriptedHandler {
    pub fn new(
        metadata: HandlerMetadata,
        handle: impl Fn(&mut MessagePacket, &mut dyn Host) -> Result<(), ErrorCode>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            handle: Box::new(handle),
        })
    }

    /// A handler that serves the given messages and always succeeds.
    pub fn noop(messages: &[(&str, Volatility)]) -> Arc<Self> {
        Self::new(metadata(messages), |_, _| Ok(()))
    }
}

impl Handler for ScriptedHandler {
    fn metadata(&self) -> HandlerMetadata {
        self.metadata.clone()
    }

    fn handle(&self, packet: &mut MessagePacket, host: &mut dyn Host) -> Result<(), ErrorCode> {
        (self.handle)(packet, host)
    }
}

/// A machine hosting scripted handlers. `foreign()` gives it its own
/// allocator, which makes the router marshal packets across the boundary.
#[derive(Default)]
pub struct TestMachine {
    handlers: HashMap<String, Arc<dyn Handler>>,
    allocator: Option<HostAllocator>,
}

impl TestMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foreign() -> Self {
        Self {
            handlers: HashMap::new(),
            allocator: Some(HostAllocator),
        }
    }

    pub fn register(mut self, id: &str, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(id.to_string(), handler);
        self
    }
}

impl Machine for TestMachine {
    fn handlers(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    fn load(&self, handler: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler).cloned()
    }

    fn allocator(&self) -> Option<&dyn Allocator> {
        self.allocator
            .as_ref()
            .map(|allocator| allocator as &dyn Allocator)
    }
}

/// A request with a zero context token (external origin).
pub fn request(
    target: &Address,
    caller: &Address,
    name: &str,
    data: &[u8],
    state_token: StateToken,
    gas_limit: u64,
) -> MessageRequest {
    MessageRequest {
        target: target.clone(),
        caller: caller.clone(),
        name: MessageName::new(name).expect("test message names are valid"),
        data: data.to_vec(),
        state_token,
        context: ContextToken::zero(),
        gas_limit,
    }
}

/// Deterministic hypervisor configuration for tests: seeded token
/// generator, no dispatch overhead.
pub fn test_config() -> crate::config::Config {
    crate::config::Config {
        dispatch_gas_cost: 0,
        token_seed: Some(42),
        ..Default::default()
    }
}

/// A finalize stub that completes only when its gate fires (or the run is
/// cancelled first).
#[derive(Clone)]
pub struct GatedFinalize {
    gate: Shared<oneshot::Receiver<()>>,
    changes: Vec<u8>,
}

impl GatedFinalize {
    pub fn new(changes: Vec<u8>) -> (Self, oneshot::Sender<()>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                gate: receiver.shared(),
                changes,
            },
            sender,
        )
    }
}

impl Finalize for GatedFinalize {
    type Tx = Vec<u8>;
    type Changes = Vec<u8>;

    async fn finalize(
        &self,
        _interrupt: Interrupt,
        request: BlockRequest,
    ) -> Result<FinalizeOutput<Vec<u8>, Vec<u8>>, ErrorCode> {
        let _ = self.gate.clone().await;
        Ok(FinalizeOutput {
            response: BlockResponse {
                height: request.height,
                results: Vec::new(),
            },
            changes: self.changes.clone(),
            transactions: request.transactions,
        })
    }
}

/// A finalize stub that completes immediately with the given outcome.
#[derive(Clone)]
pub struct InstantFinalize {
    pub changes: Vec<u8>,
    pub fail: Option<ErrorCode>,
}

impl Finalize for InstantFinalize {
    type Tx = Vec<u8>;
    type Changes = Vec<u8>;

    async fn finalize(
        &self,
        _interrupt: Interrupt,
        request: BlockRequest,
    ) -> Result<FinalizeOutput<Vec<u8>, Vec<u8>>, ErrorCode> {
        if let Some(code) = self.fail {
            return Err(code);
        }
        Ok(FinalizeOutput {
            response: BlockResponse {
                height: request.height,
                results: Vec::new(),
            },
            changes: self.changes.clone(),
            transactions: request.transactions,
        })
    }
}

/// A finalize implementation that drives a hypervisor through every
/// transaction of the block, checking for cancellation between
/// transactions.
pub struct HypervisorFinalize<S: StateManager + Send + 'static> {
    hypervisor: Arc<Mutex<Hypervisor<S>>>,
    target: Address,
    message: String,
}

impl<S: StateManager + Send + 'static> Clone for HypervisorFinalize<S> {
    fn clone(&self) -> Self {
        Self {
            hypervisor: self.hypervisor.clone(),
            target: self.target.clone(),
            message: self.message.clone(),
        }
    }
}

impl<S: StateManager + Send + 'static> HypervisorFinalize<S> {
    pub fn new(hypervisor: Arc<Mutex<Hypervisor<S>>>, target: Address, message: &str) -> Self {
        Self {
            hypervisor,
            target,
            message: message.to_string(),
        }
    }
}

impl<S: StateManager + Send + 'static> Finalize for HypervisorFinalize<S> {
    type Tx = Vec<u8>;
    type Changes = Vec<u8>;

    async fn finalize(
        &self,
        interrupt: Interrupt,
        block: BlockRequest,
    ) -> Result<FinalizeOutput<Vec<u8>, Vec<u8>>, ErrorCode> {
        let mut results = Vec::with_capacity(block.transactions.len());
        for transaction in &block.transactions {
            if interrupt.interrupted() {
                return Err(ErrorCode::Handler(INTERRUPTED_CODE));
            }
            let message = request(
                &self.target,
                &Address::system(),
                &self.message,
                transaction,
                block.state_token,
                0,
            );
            let result = self.hypervisor.lock().unwrap().call(&message);
            results.push(match result {
                Ok(response) => TxResult {
                    code: 0,
                    gas_used: response.gas_used,
                    output: response.data,
                },
                Err(code) => TxResult {
                    code: code.to_u32(),
                    gas_used: 0,
                    output: Vec::new(),
                },
            });
        }
        Ok(FinalizeOutput {
            response: BlockResponse {
                height: block.height,
                results,
            },
            changes: Vec::new(),
            transactions: block.transactions,
        })
    }
}
