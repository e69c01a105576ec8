/// How account addresses are derived at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressScheme {
    /// 8-byte big-endian counter, starting above the reserved range.
    Sequential,
    /// 32-byte SHA-256 of the handler id and the counter.
    Digest,
}

/// Configuration for the hypervisor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum dispatch recursion depth. Exceeding it is a fatal,
    /// unwinding condition (never the native stack limit).
    pub max_call_depth: usize,
    /// Flat gas charged by the router for every dispatched call, on top of
    /// handler-reported consumption.
    pub dispatch_gas_cost: u64,
    pub address_scheme: AddressScheme,
    /// Seed for the context-token generator; `None` draws from OS entropy.
    /// Fixing it makes token minting reproducible for tests.
    pub token_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_call_depth: 64,
            dispatch_gas_cost: 100,
            address_scheme: AddressScheme::Sequential,
            token_seed: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_call_depth == 0 {
            return Err("max_call_depth must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_depth() {
        let config = Config {
            max_call_depth: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
