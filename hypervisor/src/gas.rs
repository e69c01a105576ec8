use cokernel_types::{ErrorCode, SystemCode};

/// A gas meter for one call frame.
///
/// A zero limit means the frame is unmetered: consumption is tracked but
/// never exhausted. Consumption is monotonic; a failed consume leaves the
/// meter unchanged so callers observe exactly how much was charged before
/// exhaustion.
#[derive(Clone, Debug)]
pub struct GasMeter {
    limit: u64,
    used: u64,
}

impl GasMeter {
    /// Create a meter; a zero limit is unmetered.
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_metered(&self) -> bool {
        self.limit != 0
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Gas left before exhaustion; `None` when unmetered.
    pub fn remaining(&self) -> Option<u64> {
        if !self.is_metered() {
            return None;
        }
        Some(self.limit.saturating_sub(self.used))
    }

    /// Consume gas, raising out-of-gas on exhaustion.
    pub fn consume(&mut self, amount: u64) -> Result<(), ErrorCode> {
        if !self.is_metered() {
            self.used = self.used.saturating_add(amount);
            return Ok(());
        }
        let new_used = self
            .used
            .checked_add(amount)
            .ok_or(ErrorCode::System(SystemCode::OUT_OF_GAS))?;
        if new_used > self.limit {
            return Err(ErrorCode::System(SystemCode::OUT_OF_GAS));
        }
        self.used = new_used;
        Ok(())
    }

    /// Add consumption without a limit check. Unwinding bookkeeping only:
    /// the frames being popped already failed, but their burn still counts.
    pub fn absorb(&mut self, amount: u64) {
        self.used = self.used.saturating_add(amount);
    }

    /// The limit a nested call runs under, given the limit it requested.
    ///
    /// A zero request inherits this meter's remaining gas (or stays
    /// unmetered). A non-zero request is clamped to the remaining gas (a
    /// nested call can narrow its budget, never widen it) and marks the
    /// nested frame as a limit setter, the stop point for out-of-gas
    /// unwinding. Returns `(limit, set_limit)`.
    pub fn child_limit(&self, requested: u64) -> (u64, bool) {
        match (self.remaining(), requested) {
            (None, 0) => (0, false),
            (None, requested) => (requested, true),
            (Some(remaining), 0) => (remaining, false),
            (Some(remaining), requested) => (requested.min(remaining), true),
        }
    }
}
