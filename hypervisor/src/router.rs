//! The hypervisor router: account registry, dispatch, call stack, and
//! unwinding.
//!
//! One router instance owns the registry and the frame stack for the
//! foreground dispatch path. Control returns to the external caller only
//! after the whole call tree has committed, rolled back, or unwound; there
//! are no suspension points mid-call.

use crate::{
    config::{AddressScheme, Config},
    gas::GasMeter,
    machine::{Handler, Host, Machine},
    marshal::{self, HostAllocator},
    packet::{MessagePacket, PointerSlot},
    policy::{self, Authorizer},
    state::StateManager,
};
use cokernel_types::{
    Address, ContextToken, ErrorCode, HandlerId, HandlerMetadata, MessageName, MessageRequest,
    MessageResponse, StateToken, SystemCode, Volatility, ON_CREATE, ON_MIGRATE, TOKEN_LEN,
};
use commonware_cryptography::{sha256::Sha256, Hasher};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// System lifecycle messages, dispatched with an empty target address.
pub const MSG_CREATE: &str = "create";
pub const MSG_DESTROY: &str = "destroy";
pub const MSG_MIGRATE: &str = "migrate";
pub const MSG_FORCE_MIGRATE: &str = "force_migrate";

/// First address assigned by the sequential scheme; everything below is
/// reserved.
const FIRST_ACCOUNT: u64 = u16::MAX as u64 + 1;

/// Outcome of the most recent external invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dispatching,
    Committed,
    RolledBack,
    Unwound,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("machine '{0}' already registered")]
    DuplicateMachine(String),
    #[error("machine id '{0}' is reserved")]
    ReservedMachine(String),
    #[error("module '{0}' already registered")]
    DuplicateModule(String),
    #[error("module message '{message}' claimed by both '{first}' and '{second}'")]
    MessageCollision {
        message: String,
        first: String,
        second: String,
    },
    #[error("module storage initialization failed: {0}")]
    State(anyhow::Error),
}

struct ModuleEntry {
    address: Address,
    handler: Arc<dyn Handler>,
    metadata: HandlerMetadata,
}

/// One entry of the call stack.
struct Frame {
    /// The account executing in this frame (the authenticated caller of
    /// any request it issues).
    address: Address,
    token: StateToken,
    context: ContextToken,
    volatility: Volatility,
    gas: GasMeter,
    /// Whether this frame's token differs from its parent's underlying
    /// transaction; only such tokens are discarded during unwinding.
    new_token: bool,
    /// Whether this frame declared a gas limit (the stop point for
    /// out-of-gas unwinding).
    set_limit: bool,
    began_tx: bool,
    /// System codes this frame's nested calls returned, verbatim. A
    /// handler may only re-return codes recorded here.
    received: Vec<u32>,
}

/// Registers machines and modules, failing closed on any configuration
/// conflict before a single request can be dispatched.
pub struct Builder<S: StateManager> {
    state: S,
    config: Config,
    machines: HashMap<String, Arc<dyn Machine>>,
    modules: HashMap<String, ModuleEntry>,
    module_messages: HashMap<MessageName, String>,
    authorizer: Option<Arc<dyn Authorizer>>,
    next_account: u64,
}

impl<S: StateManager> Builder<S> {
    pub fn new(state: S, config: Config) -> Result<Self, BuildError> {
        config.validate().map_err(BuildError::InvalidConfig)?;
        Ok(Self {
            state,
            config,
            machines: HashMap::new(),
            modules: HashMap::new(),
            module_messages: HashMap::new(),
            authorizer: None,
            next_account: FIRST_ACCOUNT,
        })
    }

    pub fn with_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizer = Some(authorizer);
    }

    /// Register an execution environment under `id`.
    pub fn register_machine(
        &mut self,
        id: &str,
        machine: Arc<dyn Machine>,
    ) -> Result<(), BuildError> {
        if id == cokernel_types::handler::MODULE_MACHINE_ID {
            return Err(BuildError::ReservedMachine(id.to_string()));
        }
        if HandlerId::parse(&format!("{id}:probe")).is_err() {
            return Err(BuildError::InvalidIdentifier(id.to_string()));
        }
        if self.machines.contains_key(id) {
            return Err(BuildError::DuplicateMachine(id.to_string()));
        }
        self.machines.insert(id.to_string(), machine);
        Ok(())
    }

    /// Register a module handler under `name` and fix its address.
    ///
    /// Every module message the handler declares is routed globally by
    /// name; two modules claiming the same message is a fatal load-time
    /// error, not a runtime one.
    pub fn register_module(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Address, BuildError> {
        let id = HandlerId::module(name)
            .map_err(|_| BuildError::InvalidIdentifier(name.to_string()))?;
        if self.modules.contains_key(name) {
            return Err(BuildError::DuplicateModule(name.to_string()));
        }

        let metadata = handler.metadata();
        for message in &metadata.messages {
            if !message.name.is_module_message() {
                continue;
            }
            if let Some(first) = self.module_messages.get(&message.name) {
                return Err(BuildError::MessageCollision {
                    message: message.name.to_string(),
                    first: first.clone(),
                    second: name.to_string(),
                });
            }
            self.module_messages
                .insert(message.name.clone(), name.to_string());
        }

        let address = derive_address(self.config.address_scheme, self.next_account, &id);
        self.next_account += 1;
        self.modules.insert(
            name.to_string(),
            ModuleEntry {
                address: address.clone(),
                handler,
                metadata,
            },
        );
        Ok(address)
    }

    /// Finish registration: initialize module storage and produce the
    /// router.
    pub fn build(mut self) -> Result<Hypervisor<S>, BuildError> {
        let mut accounts = HashMap::new();
        for (name, entry) in &self.modules {
            self.state
                .create(&entry.address, &entry.metadata.state_config)
                .map_err(BuildError::State)?;
            accounts.insert(
                entry.address.clone(),
                HandlerId::Module(name.clone()),
            );
        }

        let rng = match self.config.token_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };

        Ok(Hypervisor {
            state: self.state,
            config: self.config,
            machines: self.machines,
            modules: self.modules,
            module_messages: self.module_messages,
            accounts,
            authorizer: self.authorizer,
            next_account: self.next_account,
            rng,
            frames: Vec::new(),
            contexts: HashMap::new(),
            unwinding: None,
            phase: Phase::Idle,
        })
    }
}

fn derive_address(scheme: AddressScheme, counter: u64, handler: &HandlerId) -> Address {
    match scheme {
        AddressScheme::Sequential => {
            Address::new(counter.to_be_bytes().to_vec()).expect("8 bytes fit an address")
        }
        AddressScheme::Digest => {
            let mut hasher = Sha256::new();
            hasher.update(handler.to_string().as_bytes());
            hasher.update(&counter.to_be_bytes());
            Address::new(hasher.finalize().as_ref().to_vec()).expect("32 bytes fit an address")
        }
    }
}

/// The cross-environment account/module execution engine.
pub struct Hypervisor<S: StateManager> {
    state: S,
    config: Config,
    machines: HashMap<String, Arc<dyn Machine>>,
    modules: HashMap<String, ModuleEntry>,
    module_messages: HashMap<MessageName, String>,
    accounts: HashMap<Address, HandlerId>,
    authorizer: Option<Arc<dyn Authorizer>>,
    next_account: u64,
    rng: ChaCha20Rng,

    frames: Vec<Frame>,
    contexts: HashMap<ContextToken, usize>,
    unwinding: Option<SystemCode>,
    phase: Phase,
}

struct ExecHost<'a, S: StateManager> {
    hypervisor: &'a mut Hypervisor<S>,
}

impl<S: StateManager> Host for ExecHost<'_, S> {
    fn invoke(&mut self, packet: &mut MessagePacket) -> Result<(), ErrorCode> {
        let result = self.hypervisor.dispatch(packet);
        // Record what the handler observed from its nested call: only
        // codes recorded here may be re-returned verbatim.
        if let Err(ErrorCode::System(code)) = &result {
            if let Some(frame) = self.hypervisor.frames.last_mut() {
                frame.received.push(code.get() as u32);
            }
        }
        result
    }
}

impl<S: StateManager> Hypervisor<S> {
    /// Outcome of the most recent external invocation.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn handler_of(&self, address: &Address) -> Option<&HandlerId> {
        self.accounts.get(address)
    }

    pub fn module_address(&self, name: &str) -> Option<&Address> {
        self.modules.get(name).map(|entry| &entry.address)
    }

    /// Dispatch one external invocation to completion.
    ///
    /// On a system error the terminal diagnostic is written into the
    /// packet's first output pointer; the returned code is the single
    /// terminal code the driver observes.
    pub fn invoke(&mut self, packet: &mut MessagePacket) -> Result<(), ErrorCode> {
        self.phase = Phase::Dispatching;
        self.frames.clear();
        self.contexts.clear();
        self.unwinding = None;

        let result = self.invoke_inner(packet);

        let total_gas = self
            .frames
            .pop()
            .map(|root| root.gas.used())
            .unwrap_or_default();
        self.frames.clear();
        self.contexts.clear();
        let unwound = self.unwinding.take().is_some();

        match &result {
            Ok(()) => {
                packet.set_gas_consumed(total_gas);
                self.phase = Phase::Committed;
            }
            Err(code) => {
                packet.set_gas_consumed(total_gas);
                self.phase = if unwound {
                    Phase::Unwound
                } else {
                    Phase::RolledBack
                };
                if let ErrorCode::System(system) = code {
                    packet.write_diagnostic(&format!("dispatch failed: {system}"));
                }
                warn!(code = code.to_u32(), unwound, "invocation failed");
            }
        }
        result
    }

    fn invoke_inner(&mut self, packet: &mut MessagePacket) -> Result<(), ErrorCode> {
        // The root frame stands for the external caller; it runs no
        // handler and owns no transaction, but carries the gas limit and
        // calling rights for the whole chain.
        let caller = packet
            .caller()
            .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        let token = packet.state_token();
        let context = self.mint_context();
        packet.set_context_token(context);

        let gas_limit = packet.gas_limit();
        self.push_frame(Frame {
            address: caller,
            token,
            context,
            volatility: token.volatility(),
            gas: GasMeter::new(gas_limit),
            new_token: false,
            set_limit: gas_limit > 0,
            began_tx: false,
            received: Vec::new(),
        });

        self.dispatch(packet)
    }

    /// Build a request packet and dispatch it, extracting the primary
    /// output.
    pub fn call(&mut self, request: &MessageRequest) -> Result<MessageResponse, ErrorCode> {
        let mut packet = packet_from_request(request);
        self.invoke(&mut packet)?;
        Ok(MessageResponse {
            data: packet.take_output(PointerSlot::Output1).unwrap_or_default(),
            gas_used: packet.gas_consumed(),
        })
    }

    /// Create an account from the external driver (system caller).
    pub fn create_account(
        &mut self,
        handler: &HandlerId,
        init: &[u8],
        token: StateToken,
    ) -> Result<Address, ErrorCode> {
        let name = MessageName::new(MSG_CREATE).expect("static name is valid");
        let mut packet = MessagePacket::new(
            &name,
            &Address::system(),
            &Address::system(),
            token,
            ContextToken::zero(),
            0,
        );
        packet.set_input(PointerSlot::Input1, handler.to_string().as_bytes());
        packet.set_input(PointerSlot::Input2, init);
        self.invoke(&mut packet)?;
        let bytes = packet
            .take_output(PointerSlot::Output1)
            .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        Address::new(bytes).map_err(|_| ErrorCode::System(SystemCode::INVALID_HANDLER))
    }

    // -- dispatch core -----------------------------------------------------

    /// Dispatch one call. Invoked at the root and recursively through
    /// [ExecHost] for nested requests.
    fn dispatch(&mut self, packet: &mut MessagePacket) -> Result<(), ErrorCode> {
        // Refuse new work while an unwinding is in flight.
        if let Some(code) = self.unwinding {
            return Err(code.into());
        }

        // Authenticate: the context token must belong to the top frame.
        let context = packet.context_token();
        let parent_index = *self
            .contexts
            .get(&context)
            .ok_or(ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER))?;
        if parent_index + 1 != self.frames.len() {
            return Err(ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER));
        }
        let real_caller = self.frames[parent_index].address.clone();

        let name = packet
            .name()
            .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        let claimed = packet
            .caller()
            .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        if claimed != real_caller {
            let request = request_view(packet)
                .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
            policy::check_caller(
                &real_caller,
                &claimed,
                self.authorizer.as_deref(),
                &request,
            )?;
        }

        // Resolve the target: module messages are routed by name and must
        // omit a caller-supplied target.
        let mut target = packet
            .target()
            .ok_or(ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        if name.is_module_message() {
            if !target.is_system() {
                return Err(ErrorCode::System(SystemCode::INVALID_HANDLER));
            }
            let module = self
                .module_messages
                .get(&name)
                .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;
            target = self.modules[module].address.clone();
            packet.set_target(&target);
        } else if target.is_system() {
            return self.system_message(&name, packet, &real_caller);
        }

        debug!(%target, name = %name, "dispatching");

        let handler_id = self
            .accounts
            .get(&target)
            .cloned()
            .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;
        let (handler, metadata, foreign) = self
            .resolve_handler(&handler_id)
            .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;
        let volatility = metadata
            .volatility_of(&name)
            .ok_or(ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND))?;

        // Policy checks against the calling frame.
        let parent = &self.frames[parent_index];
        let token = packet.state_token();
        policy::check_volatility(parent.volatility, volatility, &token)?;
        let effective_token = policy::effective_token(volatility, &token);
        // The claimed caller survived authentication (it is the real
        // caller, or the middleware approved the impersonation).
        let effective_caller = policy::effective_caller(volatility, &claimed);
        packet.set_state_token(effective_token);
        packet.set_caller(&effective_caller);

        // Gas: inherit or narrow the parent's budget.
        let (limit, set_limit) = parent.gas.child_limit(packet.gas_limit());
        packet.set_gas_limit(limit);

        // A token is new when it references a different underlying
        // transaction than the parent's (pure frames carry none).
        let new_token = volatility != Volatility::Pure
            && !effective_token.same_transaction(&parent.token);

        if self.frames.len() >= self.config.max_call_depth {
            warn!(depth = self.frames.len(), "call depth exceeded");
            return Err(self.raise_unwind(SystemCode::FATAL));
        }

        let child_context = self.mint_context();
        packet.set_context_token(child_context);
        self.push_frame(Frame {
            address: target.clone(),
            token: effective_token,
            context: child_context,
            volatility,
            gas: GasMeter::new(limit),
            new_token,
            set_limit,
            began_tx: false,
            received: Vec::new(),
        });

        if volatility != Volatility::Pure {
            if let Err(error) = self.state.begin_tx(&effective_token, &target) {
                warn!(%target, %error, "begin_tx failed");
                self.unwinding = Some(SystemCode::FATAL);
                return Err(self.unwind_current(SystemCode::FATAL));
            }
            self.top_mut().began_tx = true;
        }

        let dispatch_gas_cost = self.config.dispatch_gas_cost;
        if self
            .top_mut()
            .gas
            .consume(dispatch_gas_cost)
            .is_err()
        {
            return Err(self.unwind_current(SystemCode::OUT_OF_GAS));
        }

        // Run the handler, marshaling through the environment's allocator
        // when it does not share memory with the router.
        let gas_before = packet.gas_consumed();
        let (handler_result, dispatch_raised) = self.run_handler(&handler, foreign, packet);

        // A nested failure may have started an unwinding that the handler
        // cannot veto.
        if let Some(code) = self.unwinding {
            return Err(self.unwind_current(code));
        }

        // Meter the handler's self-reported consumption.
        let reported = packet.gas_consumed().saturating_sub(gas_before);
        if self.top_mut().gas.consume(reported).is_err() {
            return Err(self.unwind_current(SystemCode::OUT_OF_GAS));
        }

        // Handlers may not invent system codes.
        let result = match handler_result {
            Ok(()) => Ok(()),
            Err(code) if dispatch_raised => Err(code),
            Err(code) => Err(self.normalize_handler_code(code)),
        };
        self.finish_frame(result)
    }

    /// Run the handler against the shared packet, or against a marshaled
    /// copy for environments with their own memory. Returns the result and
    /// whether it was raised by the dispatch layer itself (exempt from the
    /// verbatim-code rule).
    fn run_handler(
        &mut self,
        handler: &Arc<dyn Handler>,
        foreign: Option<Arc<dyn Machine>>,
        packet: &mut MessagePacket,
    ) -> (Result<(), ErrorCode>, bool) {
        let Some(machine) = foreign else {
            let result = handler.handle(packet, &mut ExecHost { hypervisor: self });
            return (result, false);
        };

        let allocator = machine
            .allocator()
            .expect("foreign machines expose an allocator");
        let mut copy = match marshal::copy_request(packet, allocator) {
            Ok(copy) => copy,
            Err(error) => return (Err(error.into()), true),
        };
        let result = handler.handle(&mut copy, &mut ExecHost { hypervisor: self });
        if let Err(error) = marshal::copy_response(packet, &copy, &HostAllocator) {
            return (Err(error.into()), true);
        }
        (result, false)
    }

    fn normalize_handler_code(&self, code: ErrorCode) -> ErrorCode {
        match code {
            ErrorCode::Handler(_) => code,
            ErrorCode::System(system) => {
                let frame = self.frames.last().expect("dispatch frame exists");
                if frame.received.contains(&(system.get() as u32)) {
                    code
                } else {
                    warn!(code = system.get(), "handler fabricated a system code");
                    ErrorCode::System(SystemCode::INVALID_HANDLER)
                }
            }
        }
    }

    /// Pop the current frame on the normal (non-unwinding) path,
    /// committing or rolling back its transaction.
    fn finish_frame(&mut self, result: Result<(), ErrorCode>) -> Result<(), ErrorCode> {
        let frame = self.pop_frame();
        match &result {
            Ok(()) => {
                if frame.began_tx {
                    if let Err(error) = self.state.commit_tx(&frame.token) {
                        warn!(%error, "commit_tx failed");
                        self.unwinding = Some(SystemCode::FATAL);
                        return Err(SystemCode::FATAL.into());
                    }
                }
                debug!(address = %frame.address, gas = frame.gas.used(), "committed");
            }
            Err(code) => {
                if frame.began_tx {
                    if let Err(error) = self.state.rollback_tx(&frame.token) {
                        warn!(%error, "rollback_tx failed");
                        self.unwinding = Some(SystemCode::FATAL);
                        return Err(SystemCode::FATAL.into());
                    }
                }
                debug!(address = %frame.address, code = code.to_u32(), "rolled back");
            }
        }

        // Charge the child's consumption to the caller. The child's limit
        // never exceeded the caller's remaining gas, so this only fails if
        // the caller's own frame is already exhausted.
        if self.top_mut().gas.consume(frame.gas.used()).is_err() {
            return Err(self.raise_unwind(SystemCode::OUT_OF_GAS));
        }
        result
    }

    /// Begin an unwinding without popping: used when the affected frame's
    /// handler is still on the native stack (it observes the error, but
    /// its own dispatch completes the unwind and ignores its return).
    fn raise_unwind(&mut self, code: SystemCode) -> ErrorCode {
        self.unwinding = Some(code);
        code.into()
    }

    /// Pop the top frame under the unwinding rules: newly introduced
    /// tokens are discarded, inherited ones left alone, and an out-of-gas
    /// stops (with a rollback) at the frame that imposed the limit.
    fn unwind_current(&mut self, code: SystemCode) -> ErrorCode {
        let frame = self.pop_frame();
        if code == SystemCode::OUT_OF_GAS && frame.set_limit {
            if frame.began_tx {
                if let Err(error) = self.state.rollback_tx(&frame.token) {
                    warn!(%error, "rollback_tx failed during unwind");
                    self.unwinding = Some(SystemCode::FATAL);
                    return SystemCode::FATAL.into();
                }
            }
            self.unwinding = None;
            self.top_mut().gas.absorb(frame.gas.used());
            debug!(address = %frame.address, "out of gas caught at limit");
            return SystemCode::OUT_OF_GAS.into();
        }

        self.unwinding = Some(code);
        if frame.new_token {
            self.state.discard_cleanup(&frame.token);
        }
        self.top_mut().gas.absorb(frame.gas.used());
        debug!(address = %frame.address, code = code.get(), "unwound");
        code.into()
    }

    // -- system lifecycle messages ----------------------------------------

    fn system_message(
        &mut self,
        name: &MessageName,
        packet: &mut MessagePacket,
        real_caller: &Address,
    ) -> Result<(), ErrorCode> {
        let dispatch_gas_cost = self.config.dispatch_gas_cost;
        if self
            .top_mut()
            .gas
            .consume(dispatch_gas_cost)
            .is_err()
        {
            return Err(self.raise_unwind(SystemCode::OUT_OF_GAS));
        }
        match name.as_str() {
            MSG_CREATE => self.sys_create(packet, real_caller),
            MSG_DESTROY => self.sys_destroy(packet, real_caller),
            MSG_MIGRATE => self.sys_migrate(packet, real_caller),
            MSG_FORCE_MIGRATE => self.sys_force_migrate(packet, real_caller),
            _ => Err(ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND)),
        }
    }

    fn sys_create(
        &mut self,
        packet: &mut MessagePacket,
        real_caller: &Address,
    ) -> Result<(), ErrorCode> {
        let token = packet.state_token();
        if !token.is_volatile() {
            return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
        }
        let handler_id = parse_handler_input(packet.input(PointerSlot::Input1))?;
        if handler_id.is_module() {
            // Module handlers are load-time constructs.
            return Err(ErrorCode::System(SystemCode::INVALID_HANDLER));
        }
        let (_, metadata, _) = self
            .resolve_handler(&handler_id)
            .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;

        let address = derive_address(self.config.address_scheme, self.next_account, &handler_id);
        self.next_account += 1;
        if self.accounts.contains_key(&address) {
            return Err(ErrorCode::System(SystemCode::INVALID_HANDLER));
        }

        if let Err(error) = self.state.create(&address, &metadata.state_config) {
            warn!(%address, %error, "account storage creation failed");
            return Err(self.raise_unwind(SystemCode::FATAL));
        }
        self.accounts.insert(address.clone(), handler_id);
        debug!(%address, creator = %real_caller, "account created");

        // Run on_create; a handler that does not declare it still creates
        // successfully.
        let init = packet.input(PointerSlot::Input2).to_vec();
        match self.invoke_lifecycle(ON_CREATE, &address, real_caller, &init, token, packet) {
            Ok(()) | Err(ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND)) => {
                packet.set_output(PointerSlot::Output1, address.as_bytes().to_vec());
                Ok(())
            }
            Err(code) => {
                // The account never existed as far as callers can tell.
                self.accounts.remove(&address);
                if let Err(error) = self.state.destroy(&address) {
                    warn!(%address, %error, "create compensation failed");
                }
                Err(code)
            }
        }
    }

    fn sys_destroy(
        &mut self,
        packet: &mut MessagePacket,
        real_caller: &Address,
    ) -> Result<(), ErrorCode> {
        if !packet.state_token().is_volatile() {
            return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
        }
        let address = Address::new(packet.input(PointerSlot::Input1).to_vec())
            .map_err(|_| ErrorCode::System(SystemCode::INVALID_HANDLER))?;
        // Only an account may destroy itself.
        if address != *real_caller {
            return Err(ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER));
        }
        match self.accounts.get(&address) {
            None => return Err(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND)),
            Some(HandlerId::Module(_)) => {
                return Err(ErrorCode::System(SystemCode::INVALID_HANDLER))
            }
            Some(_) => {}
        }
        if let Err(error) = self.state.destroy(&address) {
            warn!(%address, %error, "account storage destroy failed");
            return Err(self.raise_unwind(SystemCode::FATAL));
        }
        self.accounts.remove(&address);
        debug!(%address, "account destroyed");
        Ok(())
    }

    fn sys_migrate(
        &mut self,
        packet: &mut MessagePacket,
        real_caller: &Address,
    ) -> Result<(), ErrorCode> {
        let token = packet.state_token();
        if !token.is_volatile() {
            return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
        }
        // Only an account may migrate itself.
        let address = real_caller.clone();
        let old_id = match self.accounts.get(&address) {
            None => return Err(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND)),
            Some(HandlerId::Module(_)) => {
                return Err(ErrorCode::System(SystemCode::INVALID_HANDLER))
            }
            Some(id) => id.clone(),
        };
        let new_id = parse_handler_input(packet.input(PointerSlot::Input1))?;
        if new_id.is_module() {
            return Err(ErrorCode::System(SystemCode::INVALID_HANDLER));
        }
        let (_, metadata, _) = self
            .resolve_handler(&new_id)
            .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;
        let on_migrate = MessageName::new(ON_MIGRATE).expect("static name is valid");
        if !metadata.serves(&on_migrate) {
            // The new handler must support migration; without it the
            // operation fails whole.
            return Err(ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND));
        }

        // Point the registry at the new handler so on_migrate resolves to
        // it; revert on any failure (no partial migration).
        self.accounts.insert(address.clone(), new_id);
        match self.invoke_lifecycle(ON_MIGRATE, &address, real_caller, &[], token, packet) {
            Ok(()) => {
                if let Err(error) = self.state.migrate(&address, &metadata.state_config) {
                    warn!(%address, %error, "storage migration failed");
                    self.accounts.insert(address, old_id);
                    return Err(self.raise_unwind(SystemCode::FATAL));
                }
                debug!(%address, "account migrated");
                Ok(())
            }
            Err(code) => {
                self.accounts.insert(address, old_id);
                Err(code)
            }
        }
    }

    fn sys_force_migrate(
        &mut self,
        packet: &mut MessagePacket,
        real_caller: &Address,
    ) -> Result<(), ErrorCode> {
        let token = packet.state_token();
        if !token.is_volatile() {
            return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
        }
        let address = real_caller.clone();
        match self.accounts.get(&address) {
            None => return Err(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND)),
            Some(HandlerId::Module(_)) => {
                return Err(ErrorCode::System(SystemCode::INVALID_HANDLER))
            }
            Some(_) => {}
        }
        let new_id = parse_handler_input(packet.input(PointerSlot::Input1))?;
        if new_id.is_module() {
            return Err(ErrorCode::System(SystemCode::INVALID_HANDLER));
        }
        let (_, metadata, _) = self
            .resolve_handler(&new_id)
            .ok_or(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))?;

        // Destructive: discard the old state wholesale and start over.
        if let Err(error) = self.state.destroy(&address) {
            warn!(%address, %error, "force-migrate destroy failed");
            return Err(self.raise_unwind(SystemCode::FATAL));
        }
        if let Err(error) = self.state.create(&address, &metadata.state_config) {
            warn!(%address, %error, "force-migrate create failed");
            return Err(self.raise_unwind(SystemCode::FATAL));
        }
        self.accounts.insert(address.clone(), new_id);
        debug!(%address, "account force-migrated");

        let init = packet.input(PointerSlot::Input2).to_vec();
        match self.invoke_lifecycle(ON_CREATE, &address, real_caller, &init, token, packet) {
            Ok(()) | Err(ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND)) => Ok(()),
            Err(code) => Err(code),
        }
    }

    /// Dispatch a lifecycle message (`on_create`/`on_migrate`) to an
    /// account through the normal path, in the caller's frame context.
    fn invoke_lifecycle(
        &mut self,
        message: &str,
        target: &Address,
        caller: &Address,
        data: &[u8],
        token: StateToken,
        parent_packet: &MessagePacket,
    ) -> Result<(), ErrorCode> {
        let name = MessageName::new(message).expect("static names are valid");
        let mut child = MessagePacket::new(
            &name,
            target,
            caller,
            token,
            parent_packet.context_token(),
            0,
        );
        if !data.is_empty() {
            child.set_input(PointerSlot::Input1, data);
        }
        self.dispatch(&mut child)
    }

    // -- frame bookkeeping -------------------------------------------------

    fn resolve_handler(
        &self,
        id: &HandlerId,
    ) -> Option<(Arc<dyn Handler>, HandlerMetadata, Option<Arc<dyn Machine>>)> {
        match id {
            HandlerId::Module(name) => {
                let entry = self.modules.get(name)?;
                Some((entry.handler.clone(), entry.metadata.clone(), None))
            }
            HandlerId::Machine { machine, handler } => {
                let environment = self.machines.get(machine)?;
                let loaded = environment.load(handler)?;
                // Metadata is re-queried before every dispatch; handler
                // versions may only change between loads.
                let metadata = environment.metadata_for(handler)?;
                let foreign = environment
                    .allocator()
                    .is_some()
                    .then(|| environment.clone());
                Some((loaded, metadata, foreign))
            }
        }
    }

    fn push_frame(&mut self, frame: Frame) {
        self.contexts.insert(frame.context, self.frames.len());
        self.frames.push(frame);
    }

    fn pop_frame(&mut self) -> Frame {
        let frame = self.frames.pop().expect("frame stack underflow");
        self.contexts.remove(&frame.context);
        frame
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is non-empty")
    }

    fn mint_context(&mut self) -> ContextToken {
        loop {
            let mut bytes = [0u8; TOKEN_LEN];
            self.rng.fill_bytes(&mut bytes);
            let token = ContextToken::from_bytes(bytes);
            if !token.is_zero() && !self.contexts.contains_key(&token) {
                return token;
            }
        }
    }
}

/// Build the wire packet for a typed request.
pub fn packet_from_request(request: &MessageRequest) -> MessagePacket {
    let mut packet = MessagePacket::new(
        &request.name,
        &request.target,
        &request.caller,
        request.state_token,
        request.context,
        request.gas_limit,
    );
    if !request.data.is_empty() {
        packet.set_input(PointerSlot::Input1, &request.data);
    }
    packet
}

fn request_view(packet: &MessagePacket) -> Option<MessageRequest> {
    Some(MessageRequest {
        target: packet.target()?,
        caller: packet.caller()?,
        name: packet.name()?,
        data: packet.input(PointerSlot::Input1).to_vec(),
        state_token: packet.state_token(),
        context: packet.context_token(),
        gas_limit: packet.gas_limit(),
    })
}

fn parse_handler_input(bytes: &[u8]) -> Result<HandlerId, ErrorCode> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| ErrorCode::System(SystemCode::INVALID_HANDLER))?;
    HandlerId::parse(raw).map_err(|_| ErrorCode::System(SystemCode::INVALID_HANDLER))
}
