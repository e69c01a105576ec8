//! Dispatch-path tests: routing, policy enforcement, gas unwinding, error
//! code propagation, and cross-environment marshaling.

#[cfg(test)]
mod tests {
    use crate::mocks::{
        metadata, readonly_token, request, test_config, volatile_token, ScriptedHandler,
        SharedState, StateOp, TestMachine,
    };
    use crate::packet::{MessagePacket, PointerSlot};
    use crate::policy::Authorizer;
    use crate::router::{Builder, Phase};
    use cokernel_types::{
        Address, ErrorCode, HandlerId, MessageName, MessageRequest, SystemCode, Volatility,
    };
    use std::sync::Arc;

    fn builder() -> (Builder<SharedState>, SharedState) {
        let state = SharedState::default();
        let builder = Builder::new(state.clone(), test_config()).unwrap();
        (builder, state)
    }

    fn tx_ops(state: &SharedState) -> Vec<StateOp> {
        state
            .journal()
            .into_iter()
            .filter(|op| {
                matches!(
                    op,
                    StateOp::Begin(..)
                        | StateOp::Commit(..)
                        | StateOp::Rollback(..)
                        | StateOp::Discard(..)
                )
            })
            .collect()
    }

    #[test]
    fn test_module_message_routes_by_name() {
        let (mut builder, state) = builder();
        let echo = ScriptedHandler::new(
            metadata(&[("module:bank/echo", Volatility::Volatile)]),
            |packet, _| {
                let data = packet.input(PointerSlot::Input1).to_vec();
                packet.set_output(PointerSlot::Output1, data);
                Ok(())
            },
        );
        let bank = builder.register_module("bank", echo).unwrap();
        let mut hypervisor = builder.build().unwrap();

        let caller = Address::new(vec![5; 4]).unwrap();
        let response = hypervisor
            .call(&request(
                &Address::system(),
                &caller,
                "module:bank/echo",
                b"hello",
                volatile_token(1),
                0,
            ))
            .unwrap();
        assert_eq!(response.data, b"hello");
        assert_eq!(hypervisor.phase(), Phase::Committed);

        // One nested transaction on the module's frame, committed.
        assert_eq!(
            tx_ops(&state),
            vec![
                StateOp::Begin(volatile_token(1), bank.clone()),
                StateOp::Commit(volatile_token(1)),
            ]
        );
    }

    #[test]
    fn test_module_message_rejects_explicit_target() {
        let (mut builder, _) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::noop(&[("module:bank/echo", Volatility::Volatile)]),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &bank,
            &Address::system(),
            "module:bank/echo",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::INVALID_HANDLER)
        );
    }

    #[test]
    fn test_unknown_address_and_message() {
        let (mut builder, _) = builder();
        let bank = builder
            .register_module("bank", ScriptedHandler::noop(&[("ping", Volatility::Volatile)]))
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let nowhere = Address::new(vec![0xaa; 8]).unwrap();
        assert_eq!(
            hypervisor
                .call(&request(
                    &nowhere,
                    &Address::system(),
                    "ping",
                    &[],
                    volatile_token(1),
                    0,
                ))
                .unwrap_err(),
            ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND)
        );
        assert_eq!(
            hypervisor
                .call(&request(
                    &bank,
                    &Address::system(),
                    "pong",
                    &[],
                    volatile_token(1),
                    0,
                ))
                .unwrap_err(),
            ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND)
        );
    }

    #[test]
    fn test_pure_target_never_sees_caller() {
        let (mut builder, state) = builder();
        let oracle = builder
            .register_module(
                "oracle",
                ScriptedHandler::new(
                    metadata(&[("whoami", Volatility::Pure)]),
                    |packet, _| {
                        let caller = packet.caller().unwrap();
                        packet.set_output(PointerSlot::Output1, caller.as_bytes().to_vec());
                        Ok(())
                    },
                ),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let caller = Address::new(vec![7; 16]).unwrap();
        let response = hypervisor
            .call(&request(&oracle, &caller, "whoami", &[], volatile_token(1), 0))
            .unwrap();
        assert!(response.data.is_empty());
        // Pure frames never touch the transaction manager.
        assert!(tx_ops(&state).is_empty());
    }

    #[test]
    fn test_readonly_token_rejected_by_volatile_target() {
        let (mut builder, state) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::noop(&[("deposit", Volatility::Volatile)]),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &bank,
            &Address::system(),
            "deposit",
            &[],
            readonly_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::VOLATILITY_VIOLATION)
        );
        // Rejected before any transaction was attempted.
        assert!(tx_ops(&state).is_empty());
    }

    #[test]
    fn test_readonly_target_gets_readonly_view() {
        let (mut builder, state) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::new(
                    metadata(&[("balance", Volatility::Readonly)]),
                    |packet, _| {
                        assert!(!packet.state_token().is_volatile());
                        Ok(())
                    },
                ),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        hypervisor
            .call(&request(
                &bank,
                &Address::system(),
                "balance",
                &[],
                volatile_token(3),
                0,
            ))
            .unwrap();
        // The readonly view shares the underlying transaction.
        assert_eq!(
            tx_ops(&state),
            vec![
                StateOp::Begin(volatile_token(3).readonly_view(), bank.clone()),
                StateOp::Commit(volatile_token(3).readonly_view()),
            ]
        );
    }

    #[test]
    fn test_nested_call_commits_lifo() {
        let (mut builder, state) = builder();
        let _bank = builder
            .register_module(
                "bank",
                ScriptedHandler::new(
                    metadata(&[("module:bank/echo", Volatility::Volatile)]),
                    |packet, _| {
                        let data = packet.input(PointerSlot::Input1).to_vec();
                        packet.set_output(PointerSlot::Output1, data);
                        Ok(())
                    },
                ),
            )
            .unwrap();
        let forward = builder
            .register_module(
                "router",
                ScriptedHandler::new(
                    metadata(&[("module:router/forward", Volatility::Volatile)]),
                    |packet, host| {
                        let data = packet.input(PointerSlot::Input1).to_vec();
                        let mut nested = MessagePacket::new(
                            &MessageName::new("module:bank/echo").unwrap(),
                            &Address::system(),
                            &packet.target().unwrap(),
                            packet.state_token(),
                            packet.context_token(),
                            0,
                        );
                        nested.set_input(PointerSlot::Input1, &data);
                        host.invoke(&mut nested)?;
                        let data = nested.take_output(PointerSlot::Output1).unwrap_or_default();
                        packet.set_output(PointerSlot::Output1, data);
                        Ok(())
                    },
                ),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let response = hypervisor
            .call(&request(
                &Address::system(),
                &Address::system(),
                "module:router/forward",
                b"pass-through",
                volatile_token(1),
                0,
            ))
            .unwrap();
        assert_eq!(response.data, b"pass-through");

        // Inner frame commits strictly before the outer one.
        let ops = tx_ops(&state);
        assert_eq!(ops.len(), 4);
        assert!(matches!(&ops[0], StateOp::Begin(_, address) if *address == forward));
        assert!(matches!(&ops[1], StateOp::Begin(..)));
        assert_eq!(ops[2], StateOp::Commit(volatile_token(1)));
        assert_eq!(ops[3], StateOp::Commit(volatile_token(1)));
    }

    #[test]
    fn test_handler_code_passes_through_and_rolls_back() {
        let (mut builder, state) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::new(
                    metadata(&[("fail", Volatility::Volatile)]),
                    |_, _| Err(ErrorCode::Handler(777)),
                ),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &bank,
            &Address::system(),
            "fail",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(result.unwrap_err(), ErrorCode::Handler(777));
        assert_eq!(hypervisor.phase(), Phase::RolledBack);
        assert_eq!(
            tx_ops(&state),
            vec![
                StateOp::Begin(volatile_token(1), bank.clone()),
                StateOp::Rollback(volatile_token(1)),
            ]
        );
    }

    #[test]
    fn test_fabricated_system_code_is_remapped() {
        let (mut builder, _) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::new(metadata(&[("lie", Volatility::Volatile)]), |_, _| {
                    // Never received from a nested call: a protocol violation.
                    Err(ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND))
                }),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &bank,
            &Address::system(),
            "lie",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::INVALID_HANDLER)
        );
    }

    #[test]
    fn test_received_system_code_passes_verbatim() {
        let (mut builder, _) = builder();
        let sink = builder
            .register_module("sink", ScriptedHandler::noop(&[("ping", Volatility::Volatile)]))
            .unwrap();
        let relay = {
            let sink = sink.clone();
            ScriptedHandler::new(
                metadata(&[("relay", Volatility::Volatile)]),
                move |packet, host| {
                    let mut nested = MessagePacket::new(
                        &MessageName::new("nope").unwrap(),
                        &sink,
                        &packet.target().unwrap(),
                        packet.state_token(),
                        packet.context_token(),
                        0,
                    );
                    // The nested call fails with message-not-found; returning
                    // it verbatim is allowed.
                    let code = host.invoke(&mut nested).unwrap_err();
                    Err(code)
                },
            )
        };
        let (relay_address, mut hypervisor) = {
            let relay_address = builder.register_module("relay", relay).unwrap();
            (relay_address, builder.build().unwrap())
        };

        let result = hypervisor.call(&request(
            &relay_address,
            &Address::system(),
            "relay",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::MESSAGE_NOT_FOUND)
        );
    }

    struct AllowAll;

    impl Authorizer for AllowAll {
        fn authorize(&self, _: &Address, _: &Address, _: &MessageRequest) -> bool {
            true
        }
    }

    fn impersonating_module() -> Arc<ScriptedHandler> {
        ScriptedHandler::new(
            metadata(&[("imp", Volatility::Volatile)]),
            |packet, host| {
                // Claim the system address as caller instead of our own.
                let mut nested = MessagePacket::new(
                    &MessageName::new("module:bank/echo").unwrap(),
                    &Address::system(),
                    &Address::system(),
                    packet.state_token(),
                    packet.context_token(),
                    0,
                );
                host.invoke(&mut nested)
            },
        )
    }

    #[test]
    fn test_impersonation_rejected_without_middleware() {
        let (mut builder, _) = builder();
        builder
            .register_module(
                "bank",
                ScriptedHandler::noop(&[("module:bank/echo", Volatility::Volatile)]),
            )
            .unwrap();
        let imp = builder.register_module("imp", impersonating_module()).unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &imp,
            &Address::system(),
            "imp",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER)
        );
    }

    #[test]
    fn test_impersonation_allowed_by_middleware() {
        let (mut builder, _) = builder();
        builder.with_authorizer(Arc::new(AllowAll));
        builder
            .register_module(
                "bank",
                ScriptedHandler::noop(&[("module:bank/echo", Volatility::Volatile)]),
            )
            .unwrap();
        let imp = builder.register_module("imp", impersonating_module()).unwrap();
        let mut hypervisor = builder.build().unwrap();

        hypervisor
            .call(&request(&imp, &Address::system(), "imp", &[], volatile_token(1), 0))
            .unwrap();
    }

    #[test]
    fn test_out_of_gas_unwinds_to_limit_setter() {
        let (mut builder, state) = builder();
        let burner = builder
            .register_module(
                "burner",
                ScriptedHandler::new(metadata(&[("burn", Volatility::Volatile)]), |packet, _| {
                    packet.consume_gas(150);
                    Ok(())
                }),
            )
            .unwrap();
        let spender = {
            let burner = burner.clone();
            ScriptedHandler::new(
                metadata(&[("spend", Volatility::Volatile)]),
                move |packet, host| {
                    // Open a nested sub-transaction token for the callee.
                    let mut nested = MessagePacket::new(
                        &MessageName::new("burn").unwrap(),
                        &burner,
                        &packet.target().unwrap(),
                        volatile_token(9),
                        packet.context_token(),
                        0,
                    );
                    host.invoke(&mut nested)
                },
            )
        };
        let spender_address = builder.register_module("spender", spender).unwrap();
        let mut hypervisor = builder.build().unwrap();

        // The outer call declares limit 100; the nested call inherits it
        // and overruns.
        let result = hypervisor.call(&request(
            &spender_address,
            &Address::system(),
            "spend",
            &[],
            volatile_token(1),
            100,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::OUT_OF_GAS)
        );

        let ops = tx_ops(&state);
        assert_eq!(
            ops,
            vec![
                StateOp::Begin(volatile_token(1), spender_address.clone()),
                StateOp::Begin(volatile_token(9), burner.clone()),
                // The nested frame introduced its token: discarded, not
                // rolled back.
                StateOp::Discard(volatile_token(9)),
                // The limit-setting frame's own transaction is rolled back.
                StateOp::Rollback(volatile_token(1)),
            ]
        );
    }

    #[test]
    fn test_gas_within_limit_commits_and_reports() {
        let (mut builder, _) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::new(metadata(&[("work", Volatility::Volatile)]), |packet, _| {
                    packet.consume_gas(40);
                    Ok(())
                }),
            )
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let response = hypervisor
            .call(&request(
                &bank,
                &Address::system(),
                "work",
                &[],
                volatile_token(1),
                100,
            ))
            .unwrap();
        assert_eq!(response.gas_used, 40);
    }

    #[test]
    fn test_call_depth_is_bounded_and_fatal() {
        let (mut builder, _) = builder();
        let recurse = ScriptedHandler::new(
            metadata(&[("recurse", Volatility::Volatile)]),
            |packet, host| {
                let target = packet.target().unwrap();
                let mut nested = MessagePacket::new(
                    &MessageName::new("recurse").unwrap(),
                    &target,
                    &target,
                    packet.state_token(),
                    packet.context_token(),
                    0,
                );
                host.invoke(&mut nested)
            },
        );
        let address = builder.register_module("loop", recurse).unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &address,
            &Address::system(),
            "recurse",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(result.unwrap_err(), ErrorCode::System(SystemCode::FATAL));
        assert_eq!(hypervisor.phase(), Phase::Unwound);
    }

    #[test]
    fn test_foreign_machine_marshals_packets() {
        let (mut builder, _) = builder();
        let echo = ScriptedHandler::new(
            metadata(&[("fecho", Volatility::Volatile)]),
            |packet, _| {
                let data = packet.input(PointerSlot::Input1).to_vec();
                packet.set_output(PointerSlot::Output1, data);
                packet.consume_gas(11);
                Ok(())
            },
        );
        builder
            .register_machine("ext", Arc::new(TestMachine::foreign().register("fecho", echo)))
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let address = hypervisor
            .create_account(
                &HandlerId::parse("ext:fecho").unwrap(),
                &[],
                volatile_token(1),
            )
            .unwrap();

        // The handler ran against a marshaled copy; outputs and gas were
        // copied back into the source packet.
        let response = hypervisor
            .call(&request(
                &address,
                &Address::system(),
                "fecho",
                b"across the boundary",
                volatile_token(1),
                0,
            ))
            .unwrap();
        assert_eq!(response.data, b"across the boundary");
        assert_eq!(response.gas_used, 11);
    }

    #[test]
    fn test_diagnostic_written_for_system_errors() {
        let (mut builder, _) = builder();
        builder
            .register_module("bank", ScriptedHandler::noop(&[("ping", Volatility::Volatile)]))
            .unwrap();
        let mut hypervisor = builder.build().unwrap();

        let nowhere = Address::new(vec![0xbb; 4]).unwrap();
        let mut packet = crate::router::packet_from_request(&request(
            &nowhere,
            &Address::system(),
            "ping",
            &[],
            volatile_token(1),
            0,
        ));
        let result = hypervisor.invoke(&mut packet);
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::ACCOUNT_NOT_FOUND)
        );
        let diagnostic = packet.output(PointerSlot::Output1).unwrap();
        assert!(std::str::from_utf8(diagnostic).unwrap().contains("not found"));
    }

    #[test]
    fn test_readonly_frame_cannot_call_volatile() {
        let (mut builder, _) = builder();
        let bank = builder
            .register_module(
                "bank",
                ScriptedHandler::noop(&[("deposit", Volatility::Volatile)]),
            )
            .unwrap();
        let reader = {
            let bank = bank.clone();
            ScriptedHandler::new(
                metadata(&[("peek", Volatility::Readonly)]),
                move |packet, host| {
                    let mut nested = MessagePacket::new(
                        &MessageName::new("deposit").unwrap(),
                        &bank,
                        &packet.target().unwrap(),
                        packet.state_token(),
                        packet.context_token(),
                        0,
                    );
                    // Escalation attempt must fail; return it verbatim.
                    Err(host.invoke(&mut nested).unwrap_err())
                },
            )
        };
        let reader_address = builder.register_module("reader", reader).unwrap();
        let mut hypervisor = builder.build().unwrap();

        let result = hypervisor.call(&request(
            &reader_address,
            &Address::system(),
            "peek",
            &[],
            volatile_token(1),
            0,
        ));
        assert_eq!(
            result.unwrap_err(),
            ErrorCode::System(SystemCode::VOLATILITY_VIOLATION)
        );
    }

}
