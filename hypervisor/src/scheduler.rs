//! Optimistic (speculative) execution of block finalization.
//!
//! The scheduler runs one finalize call in the background against a
//! tentative state token, so the expensive work starts before the network
//! finishes agreeing on the proposal. Nothing escapes a speculative run:
//! its state changes are only returned through [Optimistic::wait_result]
//! and applied by the caller, so cancellation can never leave a partial
//! application behind.
//!
//! At most one run exists at a time. Cancellation is cooperative: the
//! finalize future receives an [Interrupt] it may poll at its own check
//! points, and the scheduler additionally races the whole future against
//! the same signal, so an abandoned run stops at its next suspension
//! point. `abort` always blocks for the completion signal: it never
//! returns while the task might still be executing.

use cokernel_types::{BlockRequest, BlockResponse, ErrorCode};
use commonware_cryptography::{sha256::Digest, Digestible};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("a speculative run is already in progress")]
    AlreadyRunning,
    #[error("a speculative run is still outstanding")]
    Outstanding,
    #[error("no speculative run was started")]
    NotStarted,
    #[error("speculative execution aborted")]
    Aborted,
    #[error("finalize failed: {0}")]
    Failed(ErrorCode),
}

/// Cancellation observer handed to the finalize future.
///
/// Checking is cheap; well-behaved finalize implementations poll it at
/// their own check points (e.g. between transactions) and bail out early.
#[derive(Clone)]
pub struct Interrupt {
    signal: Shared<oneshot::Receiver<()>>,
}

impl Interrupt {
    pub fn interrupted(&self) -> bool {
        self.signal.peek().is_some()
    }

    /// Resolves when the run is cancelled.
    pub async fn cancelled(&self) {
        let _ = self.signal.clone().await;
    }
}

/// Everything a completed finalize run produced.
#[derive(Clone, Debug)]
pub struct FinalizeOutput<Tx, Changes> {
    pub response: BlockResponse,
    pub changes: Changes,
    pub transactions: Vec<Tx>,
}

/// The finalize entry point consumed by the scheduler, invoked once per
/// speculative run.
pub trait Finalize: Clone + Send + 'static {
    /// Decoded transaction type returned alongside the response.
    type Tx: Clone + Send + 'static;
    /// The tentative state-change set, applied by the caller after
    /// agreement (opaque to the scheduler).
    type Changes: Clone + Send + 'static;

    fn finalize(
        &self,
        interrupt: Interrupt,
        request: BlockRequest,
    ) -> impl Future<Output = Result<FinalizeOutput<Self::Tx, Self::Changes>, ErrorCode>> + Send;
}

type RunOutput<F> =
    FinalizeOutput<<F as Finalize>::Tx, <F as Finalize>::Changes>;

struct Run<F: Finalize> {
    digest: Digest,
    request: BlockRequest,
    output: Option<Result<RunOutput<F>, SchedulerError>>,
    cancel: Option<oneshot::Sender<()>>,
    done: Shared<oneshot::Receiver<()>>,
}

struct Inner<F: Finalize> {
    run: Option<Run<F>>,
}

/// Speculative finalize runner.
///
/// All shared fields live behind one lock that is never held across the
/// task's own work, so a canceling reader never blocks on the very task it
/// is trying to cancel.
pub struct Optimistic<E, F>
where
    E: Clock + Spawner + Metrics + Rng,
    F: Finalize,
{
    context: E,
    finalize: F,
    /// Percentage of runs aborted by `abort_if_needed` regardless of the
    /// digest, for testing only.
    abort_rate: u8,
    inner: Arc<Mutex<Inner<F>>>,
}

impl<E, F> Optimistic<E, F>
where
    E: Clock + Spawner + Metrics + Rng,
    F: Finalize,
{
    pub fn new(context: E, finalize: F) -> Self {
        Self {
            context,
            finalize,
            abort_rate: 0,
            inner: Arc::new(Mutex::new(Inner { run: None })),
        }
    }

    /// Test hook: abort this percentage of runs on `abort_if_needed` even
    /// when the digest matches. Must not be used in production.
    pub fn with_abort_rate(mut self, rate: u8) -> Self {
        assert!(rate <= 100);
        self.abort_rate = rate;
        self
    }

    /// Whether a request has been populated (running or completed, until
    /// the next `reset`).
    pub fn initialized(&self) -> bool {
        self.inner.lock().unwrap().run.is_some()
    }

    /// The request of the current run, if any.
    pub fn pending(&self) -> Option<BlockRequest> {
        self.inner
            .lock()
            .unwrap()
            .run
            .as_ref()
            .map(|run| run.request.clone())
    }

    /// Snapshot the request and start the finalize call as a background
    /// task. Fails if a run is already in progress.
    pub fn execute(&mut self, request: BlockRequest) -> Result<(), SchedulerError> {
        let (cancel_sender, cancel_receiver) = oneshot::channel();
        let (done_sender, done_receiver) = oneshot::channel();
        let cancel = cancel_receiver.shared();
        let done = done_receiver.shared();

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(run) = &inner.run {
                if run.output.is_none() {
                    return Err(SchedulerError::AlreadyRunning);
                }
            }
            inner.run = Some(Run {
                digest: request.digest(),
                request: request.clone(),
                output: None,
                cancel: Some(cancel_sender),
                done: done.clone(),
            });
        }

        debug!(height = request.height, "speculative execution started");
        let interrupt = Interrupt {
            signal: cancel.clone(),
        };
        let finalize = self.finalize.clone();
        let shared = self.inner.clone();
        self.context
            .with_label("optimistic")
            .spawn(move |context| async move {
                let started = context.current();
                let result = select! {
                    output = finalize.finalize(interrupt, request) => {
                        match output {
                            Ok(output) => Ok(output),
                            Err(code) => Err(SchedulerError::Failed(code)),
                        }
                    },
                    _ = cancel => { Err(SchedulerError::Aborted) },
                };
                let elapsed = context
                    .current()
                    .duration_since(started)
                    .unwrap_or_default();
                let aborted = matches!(result, Err(SchedulerError::Aborted));

                {
                    let mut inner = shared.lock().unwrap();
                    if let Some(run) = inner.run.as_mut() {
                        run.output = Some(result);
                    }
                }
                let _ = done_sender.send(());
                debug!(?elapsed, aborted, "speculative execution finished");
            });
        Ok(())
    }

    /// Cancel the run if its request digest differs from `expected` (or
    /// the injected test-abort rate fires). Returns whether an abort was
    /// triggered; callers observe the outcome through `wait_result`.
    pub fn abort_if_needed(&mut self, expected: &Digest) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(run) = inner.run.as_mut() else {
                return false;
            };
            if run.digest != *expected {
                warn!("speculative execution aborted: digest mismatch");
                if let Some(cancel) = run.cancel.take() {
                    let _ = cancel.send(());
                }
                return true;
            }
        }

        if self.abort_rate > 0 && self.context.gen_range(0..100u8) < self.abort_rate {
            let mut inner = self.inner.lock().unwrap();
            if let Some(run) = inner.run.as_mut() {
                if let Some(cancel) = run.cancel.take() {
                    let _ = cancel.send(());
                }
            }
            warn!("speculative execution aborted: test abort rate");
            return true;
        }
        false
    }

    /// Cancel unconditionally and block until the task has fully stopped.
    /// Idempotent; a no-op when nothing is running.
    pub async fn abort(&self) {
        let done = {
            let mut inner = self.inner.lock().unwrap();
            let Some(run) = inner.run.as_mut() else {
                return;
            };
            if let Some(cancel) = run.cancel.take() {
                let _ = cancel.send(());
            }
            run.done.clone()
        };
        // Cancellation is cooperative and not instantaneous: wait for the
        // completion signal before declaring the task stopped.
        let _ = done.await;
    }

    /// Block until the completion signal fires and return the captured
    /// result. A second call without an intervening `reset`/`execute`
    /// observes the same result.
    pub async fn wait_result(&self) -> Result<RunOutput<F>, SchedulerError> {
        let done = {
            let inner = self.inner.lock().unwrap();
            match &inner.run {
                None => return Err(SchedulerError::NotStarted),
                Some(run) => run.done.clone(),
            }
        };
        let _ = done.await;

        let inner = self.inner.lock().unwrap();
        match &inner.run {
            Some(run) => run
                .output
                .clone()
                .unwrap_or(Err(SchedulerError::Aborted)),
            None => Err(SchedulerError::NotStarted),
        }
    }

    /// Clear the captured run. Refuses while a run is outstanding: callers
    /// must `abort` (which waits) or `wait_result` first.
    pub fn reset(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = &inner.run {
            if run.output.is_none() {
                return Err(SchedulerError::Outstanding);
            }
        }
        inner.run = None;
        Ok(())
    }
}
