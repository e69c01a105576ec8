//! Volatility and caller-authorization checks applied before every
//! dispatch.
//!
//! Volatility forms a strict lattice (`pure < readonly < volatile`): a
//! frame may only call targets at or below its own level, and a volatile
//! target can never run against a readonly token. Caller identity is
//! authenticated by the router from the parent frame; this module only
//! decides whether a mismatching claim is allowed to stand.

use cokernel_types::{Address, ErrorCode, MessageRequest, StateToken, SystemCode, Volatility};

/// Optional middleware consulted when a request claims a caller other than
/// the authenticated one.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, real: &Address, claimed: &Address, request: &MessageRequest) -> bool;
}

/// Reject lattice violations between the calling frame, the target
/// handler's declared volatility, and the state token in hand.
pub(crate) fn check_volatility(
    frame: Volatility,
    target: Volatility,
    token: &StateToken,
) -> Result<(), ErrorCode> {
    if target == Volatility::Volatile && !token.is_volatile() {
        return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
    }
    if !frame.may_call(target) {
        return Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION));
    }
    Ok(())
}

/// The token the target frame actually receives: volatile targets keep the
/// token, readonly targets get the readonly view, pure targets get no
/// token at all (and the transaction manager is never consulted).
pub(crate) fn effective_token(target: Volatility, token: &StateToken) -> StateToken {
    match target {
        Volatility::Volatile => *token,
        Volatility::Readonly => token.readonly_view(),
        Volatility::Pure => StateToken::zero(),
    }
}

/// The caller address the target frame observes: always present for
/// volatile targets, present-if-known for readonly, always stripped for
/// pure.
pub(crate) fn effective_caller(target: Volatility, caller: &Address) -> Address {
    match target {
        Volatility::Volatile | Volatility::Readonly => caller.clone(),
        Volatility::Pure => Address::system(),
    }
}

/// Reject impersonation: a claimed caller that differs from the
/// authenticated one passes only if the middleware approves it.
pub(crate) fn check_caller(
    real: &Address,
    claimed: &Address,
    authorizer: Option<&dyn Authorizer>,
    request: &MessageRequest,
) -> Result<(), ErrorCode> {
    if claimed == real {
        return Ok(());
    }
    match authorizer {
        Some(authorizer) if authorizer.authorize(real, claimed, request) => Ok(()),
        _ => Err(ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cokernel_types::{ContextToken, MessageName};

    fn volatile_token() -> StateToken {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[1] = 7;
        StateToken::from_bytes(bytes)
    }

    #[test]
    fn test_volatile_target_needs_volatile_token() {
        let readonly = volatile_token().readonly_view();
        assert_eq!(
            check_volatility(Volatility::Volatile, Volatility::Volatile, &readonly),
            Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION))
        );
        assert!(
            check_volatility(Volatility::Volatile, Volatility::Volatile, &volatile_token())
                .is_ok()
        );
    }

    #[test]
    fn test_lattice_is_enforced() {
        let token = volatile_token();
        assert_eq!(
            check_volatility(Volatility::Readonly, Volatility::Volatile, &token),
            Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION))
        );
        assert_eq!(
            check_volatility(Volatility::Pure, Volatility::Readonly, &token),
            Err(ErrorCode::System(SystemCode::VOLATILITY_VIOLATION))
        );
        assert!(check_volatility(Volatility::Readonly, Volatility::Pure, &token).is_ok());
    }

    #[test]
    fn test_effective_token_downgrades() {
        let token = volatile_token();
        assert!(effective_token(Volatility::Volatile, &token).is_volatile());
        let readonly = effective_token(Volatility::Readonly, &token);
        assert!(!readonly.is_volatile());
        assert!(readonly.same_transaction(&token));
        assert_eq!(effective_token(Volatility::Pure, &token), StateToken::zero());
    }

    #[test]
    fn test_pure_strips_caller() {
        let caller = Address::new(vec![1, 2, 3]).unwrap();
        assert_eq!(effective_caller(Volatility::Volatile, &caller), caller);
        assert_eq!(effective_caller(Volatility::Readonly, &caller), caller);
        assert!(effective_caller(Volatility::Pure, &caller).is_system());
    }

    struct AllowAll;

    impl Authorizer for AllowAll {
        fn authorize(&self, _: &Address, _: &Address, _: &MessageRequest) -> bool {
            true
        }
    }

    fn request(claimed: &Address) -> MessageRequest {
        MessageRequest {
            target: Address::new(vec![9]).unwrap(),
            caller: claimed.clone(),
            name: MessageName::new("transfer").unwrap(),
            data: Vec::new(),
            state_token: volatile_token(),
            context: ContextToken::zero(),
            gas_limit: 0,
        }
    }

    #[test]
    fn test_impersonation_needs_middleware() {
        let real = Address::new(vec![1]).unwrap();
        let claimed = Address::new(vec![2]).unwrap();
        let request = request(&claimed);

        assert_eq!(
            check_caller(&real, &claimed, None, &request),
            Err(ErrorCode::System(SystemCode::UNAUTHORIZED_CALLER))
        );
        assert!(check_caller(&real, &claimed, Some(&AllowAll), &request).is_ok());
        assert!(check_caller(&real, &real, None, &request).is_ok());
    }
}
