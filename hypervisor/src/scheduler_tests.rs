//! Optimistic execution scheduler tests, run on the deterministic runtime.

#[cfg(test)]
mod tests {
    use crate::mocks::{
        test_config, volatile_token, GatedFinalize, HypervisorFinalize, InstantFinalize,
        ScriptedHandler, SharedState, StateOp,
    };
    use crate::packet::PointerSlot;
    use crate::router::Builder;
    use crate::scheduler::{Optimistic, SchedulerError};
    use cokernel_types::{BlockRequest, ErrorCode, Volatility};
    use commonware_cryptography::Digestible;
    use commonware_runtime::{deterministic, Metrics, Runner as _};
    use std::sync::{Arc, Mutex};

    fn block(height: u64, transactions: Vec<Vec<u8>>) -> BlockRequest {
        BlockRequest::new(height, height * 1_000, volatile_token(1), transactions)
    }

    #[test]
    fn test_execute_then_wait_result() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let finalize = InstantFinalize {
                changes: vec![1, 2, 3],
                fail: None,
            };
            let mut scheduler = Optimistic::new(context.with_label("oe"), finalize);
            assert!(!scheduler.initialized());

            scheduler.execute(block(1, vec![b"tx".to_vec()])).unwrap();
            assert!(scheduler.initialized());
            assert_eq!(scheduler.pending().unwrap().height, 1);

            let output = scheduler.wait_result().await.unwrap();
            assert_eq!(output.response.height, 1);
            assert_eq!(output.changes, vec![1, 2, 3]);
            assert_eq!(output.transactions, vec![b"tx".to_vec()]);

            // A second wait observes the already-captured result.
            let again = scheduler.wait_result().await.unwrap();
            assert_eq!(again.response.height, 1);

            scheduler.reset().unwrap();
            assert!(!scheduler.initialized());
        });
    }

    #[test]
    fn test_wait_without_execute() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let scheduler = Optimistic::new(
                context,
                InstantFinalize {
                    changes: Vec::new(),
                    fail: None,
                },
            );
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::NotStarted
            );
        });
    }

    #[test]
    fn test_finalize_failure_is_captured() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut scheduler = Optimistic::new(
                context,
                InstantFinalize {
                    changes: Vec::new(),
                    fail: Some(ErrorCode::Handler(500)),
                },
            );
            scheduler.execute(block(2, Vec::new())).unwrap();
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::Failed(ErrorCode::Handler(500))
            );
        });
    }

    #[test]
    fn test_abort_if_needed_on_digest_mismatch() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (finalize, _gate) = GatedFinalize::new(vec![9]);
            let mut scheduler = Optimistic::new(context, finalize);

            let proposed = block(5, vec![b"a".to_vec()]);
            let decided = block(5, vec![b"b".to_vec()]);
            scheduler.execute(proposed).unwrap();

            assert!(scheduler.abort_if_needed(&decided.digest()));
            // The run never completes with a state-change set: only the
            // cancellation error is observable.
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::Aborted
            );
        });
    }

    #[test]
    fn test_abort_if_needed_matching_digest_completes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (finalize, gate) = GatedFinalize::new(vec![7]);
            let mut scheduler = Optimistic::new(context, finalize);

            let proposed = block(6, vec![b"a".to_vec()]);
            scheduler.execute(proposed.clone()).unwrap();

            assert!(!scheduler.abort_if_needed(&proposed.digest()));
            gate.send(()).unwrap();

            let output = scheduler.wait_result().await.unwrap();
            assert_eq!(output.changes, vec![7]);
        });
    }

    #[test]
    fn test_abort_rate_forces_abort() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (finalize, _gate) = GatedFinalize::new(Vec::new());
            let mut scheduler = Optimistic::new(context, finalize).with_abort_rate(100);

            let proposed = block(7, Vec::new());
            scheduler.execute(proposed.clone()).unwrap();
            // Matching digest, but the injected abort rate fires.
            assert!(scheduler.abort_if_needed(&proposed.digest()));
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::Aborted
            );
        });
    }

    #[test]
    fn test_abort_is_idempotent_and_never_blocks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Nothing running: both calls are no-ops.
            let (finalize, _gate) = GatedFinalize::new(Vec::new());
            let mut scheduler = Optimistic::new(context, finalize);
            scheduler.abort().await;
            scheduler.abort().await;

            // With a run in flight: the first abort cancels and waits for
            // the task to fully stop, the second returns immediately.
            scheduler.execute(block(8, Vec::new())).unwrap();
            scheduler.abort().await;
            scheduler.abort().await;
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::Aborted
            );
        });
    }

    #[test]
    fn test_execute_and_reset_refuse_while_running() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (finalize, gate) = GatedFinalize::new(Vec::new());
            let mut scheduler = Optimistic::new(context, finalize);

            scheduler.execute(block(9, Vec::new())).unwrap();
            assert_eq!(
                scheduler.execute(block(10, Vec::new())).unwrap_err(),
                SchedulerError::AlreadyRunning
            );
            assert_eq!(scheduler.reset().unwrap_err(), SchedulerError::Outstanding);

            gate.send(()).unwrap();
            scheduler.wait_result().await.unwrap();
            scheduler.reset().unwrap();

            // After reset a new run may start (the gate already fired, so
            // it completes immediately).
            scheduler.execute(block(10, Vec::new())).unwrap();
            scheduler.wait_result().await.unwrap();
        });
    }

    #[test]
    fn test_finalize_drives_hypervisor_speculatively() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let state = SharedState::default();
            let mut builder = Builder::new(state.clone(), test_config()).unwrap();
            let bank = builder
                .register_module(
                    "bank",
                    ScriptedHandler::new(
                        crate::mocks::metadata(&[("apply", Volatility::Volatile)]),
                        |packet, _| {
                            let data = packet.input(PointerSlot::Input1).to_vec();
                            packet.set_output(PointerSlot::Output1, data);
                            Ok(())
                        },
                    ),
                )
                .unwrap();
            let hypervisor = Arc::new(Mutex::new(builder.build().unwrap()));
            let finalize = HypervisorFinalize::new(hypervisor, bank, "apply");

            let mut scheduler = Optimistic::new(context.with_label("oe"), finalize);
            scheduler
                .execute(block(3, vec![b"t1".to_vec(), b"t2".to_vec()]))
                .unwrap();

            let output = scheduler.wait_result().await.unwrap();
            assert_eq!(output.response.results.len(), 2);
            assert!(output.response.results.iter().all(|result| result.code == 0));
            assert_eq!(output.response.results[0].output, b"t1");

            // Every transaction ran in its own committed frame against the
            // tentative token.
            assert_eq!(state.count(|op| matches!(op, StateOp::Commit(_))), 2);
            assert_eq!(state.count(|op| matches!(op, StateOp::Rollback(_))), 0);
        });
    }

    #[test]
    fn test_aborted_run_applies_no_state() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (finalize, _gate) = GatedFinalize::new(vec![1]);
            let mut scheduler = Optimistic::new(context, finalize);

            let proposed = block(11, vec![b"a".to_vec()]);
            scheduler.execute(proposed).unwrap();
            scheduler.abort().await;

            // No state-change set escapes an aborted run.
            assert_eq!(
                scheduler.wait_result().await.unwrap_err(),
                SchedulerError::Aborted
            );
            // Reset is safe once the abort has been awaited.
            scheduler.reset().unwrap();
            assert!(!scheduler.initialized());
        });
    }
}
