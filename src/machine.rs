use crate::error::ConfigError;
use crate::target::Target;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Abstract description of the machine the cost model estimates for.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MachineParams {
    /// Number of cores available to parallel loops.
    pub parallelism: u32,
    /// Last-level cache size in bytes.
    pub cache_bytes: u64,
    /// Cost of moving one cache line from memory, in units of one arithmetic
    /// operation.
    pub balance: f64,
    pub line_size: u32,
    pub vector_bytes: u32,
}

impl MachineParams {
    /// Builds params with the default line size and vector width.
    pub fn new(parallelism: u32, cache_bytes: u64, balance: f64) -> Result<Self, ConfigError> {
        let params = MachineParams {
            parallelism,
            cache_bytes,
            balance,
            ..MachineParams::default()
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn bad(field: &'static str, value: impl ToString) -> ConfigError {
            ConfigError::BadMachineParams {
                field,
                value: value.to_string(),
            }
        }

        if self.parallelism == 0 {
            return Err(bad("parallelism", self.parallelism));
        }
        if self.cache_bytes == 0 {
            return Err(bad("cache_bytes", self.cache_bytes));
        }
        if !(self.balance.is_finite() && self.balance > 0.0) {
            return Err(bad("balance", self.balance));
        }
        if self.line_size == 0 {
            return Err(bad("line_size", self.line_size));
        }
        if self.vector_bytes == 0 {
            return Err(bad("vector_bytes", self.vector_bytes));
        }
        Ok(())
    }

    /// The description of `Tgt`, including its line size and vector width.
    pub fn for_target<Tgt: Target>() -> Self {
        Tgt::machine_params()
    }

    /// Cost of moving one byte between memory and the last-level cache.
    pub fn cost_per_byte(&self) -> f64 {
        self.balance / f64::from(self.line_size)
    }
}

impl Default for MachineParams {
    fn default() -> Self {
        MachineParams {
            parallelism: 16,
            cache_bytes: 16 * 1024 * 1024,
            balance: 40.0,
            line_size: 64,
            vector_bytes: 32,
        }
    }
}

impl FromStr for MachineParams {
    type Err = ConfigError;

    /// Parses the `parallelism,cache_bytes,balance` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || ConfigError::MachineParamsSyntax(s.to_string());
        let parts = s.split(',').map(str::trim).collect::<Vec<_>>();
        let [parallelism, cache_bytes, balance] = parts[..] else {
            return Err(syntax());
        };
        MachineParams::new(
            parallelism.parse().map_err(|_| syntax())?,
            cache_bytes.parse().map_err(|_| syntax())?,
            balance.parse().map_err(|_| syntax())?,
        )
    }
}

impl Display for MachineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.parallelism, self.cache_bytes, self.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ArmTarget, TargetId, X86Target};
    use proptest::prelude::*;

    #[test]
    fn test_parse_machine_params() {
        let params: MachineParams = "16,16777216,40".parse().unwrap();
        assert_eq!(params, MachineParams::default());
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert_eq!(
            "16,40".parse::<MachineParams>(),
            Err(ConfigError::MachineParamsSyntax("16,40".to_string()))
        );
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        assert!(matches!(
            "0,1024,40".parse::<MachineParams>(),
            Err(ConfigError::BadMachineParams {
                field: "parallelism",
                ..
            })
        ));
    }

    #[test]
    fn test_negative_balance_is_rejected() {
        assert!(MachineParams::new(4, 1024, -1.0).is_err());
    }

    #[test]
    fn test_for_target_fills_vector_width() {
        let x86 = MachineParams::for_target::<X86Target>();
        assert_eq!(x86.vector_bytes, 32);
        assert_eq!(x86.line_size, 64);
    }

    proptest! {
        #[test]
        fn test_target_params_are_valid(target in any::<TargetId>()) {
            prop_assert!(target.machine_params().validate().is_ok());
        }
    }

    #[test]
    fn test_display_round_trips() {
        let params = MachineParams::for_target::<ArmTarget>();
        let reparsed: MachineParams = params.to_string().parse().unwrap();
        assert_eq!(reparsed.parallelism, params.parallelism);
        assert_eq!(reparsed.cache_bytes, params.cache_bytes);
    }
}
