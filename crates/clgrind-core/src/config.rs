//! Simulator configuration
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `CLGRIND_NUM_THREADS` | worker threads (0 = hardware concurrency) |
//! | `CLGRIND_QUICK` | run only the first and last work-group |
//! | `CLGRIND_MAX_ERRORS` | diagnostics surfaced before suppression |
//! | `CLGRIND_STOP_ERRORS` | stop dispatching work-groups after an error |

use crate::memory::DEFAULT_BUFFER_BITS;
use clgrind_tracing::parse_flag;

pub const ENV_NUM_THREADS: &str = "CLGRIND_NUM_THREADS";
pub const ENV_QUICK: &str = "CLGRIND_QUICK";
pub const ENV_MAX_ERRORS: &str = "CLGRIND_MAX_ERRORS";
pub const ENV_STOP_ERRORS: &str = "CLGRIND_STOP_ERRORS";

/// Default cap on surfaced diagnostics.
pub const DEFAULT_MAX_ERRORS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Worker threads used to run work-groups
    pub num_workers: usize,
    /// Only execute the first and the last work-group
    pub quick: bool,
    /// Diagnostics beyond this count are counted but not surfaced
    pub max_errors: usize,
    /// Stop dispatching work-groups after the first error diagnostic
    pub stop_on_error: bool,
    /// Bits of each address used for the buffer id
    pub buffer_bits: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            quick: false,
            max_errors: DEFAULT_MAX_ERRORS,
            stop_on_error: false,
            buffer_bits: DEFAULT_BUFFER_BITS,
        }
    }
}

impl SimulatorConfig {
    /// Single-threaded configuration, useful for deterministic runs.
    pub fn serial() -> Self {
        Self {
            num_workers: 1,
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(threads) = parse_var::<usize>(ENV_NUM_THREADS) {
            config.num_workers = if threads == 0 { num_cpus::get().max(1) } else { threads };
        }
        if let Ok(quick) = std::env::var(ENV_QUICK) {
            config.quick = parse_flag(&quick);
        }
        if let Some(max_errors) = parse_var::<usize>(ENV_MAX_ERRORS) {
            config.max_errors = max_errors;
        }
        if let Ok(stop) = std::env::var(ENV_STOP_ERRORS) {
            config.stop_on_error = parse_flag(&stop);
        }

        config
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [ENV_NUM_THREADS, ENV_QUICK, ENV_MAX_ERRORS, ENV_STOP_ERRORS] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = SimulatorConfig::from_env();
        assert_eq!(config, SimulatorConfig::default());
        assert!(config.num_workers >= 1);
        assert_eq!(config.buffer_bits, 16);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(ENV_NUM_THREADS, "3");
        std::env::set_var(ENV_QUICK, "1");
        std::env::set_var(ENV_MAX_ERRORS, "7");
        std::env::set_var(ENV_STOP_ERRORS, "true");
        let config = SimulatorConfig::from_env();
        clear_env();

        assert_eq!(config.num_workers, 3);
        assert!(config.quick);
        assert_eq!(config.max_errors, 7);
        assert!(config.stop_on_error);
    }

    #[test]
    #[serial]
    fn test_bad_values_are_ignored() {
        clear_env();
        std::env::set_var(ENV_MAX_ERRORS, "lots");
        let config = SimulatorConfig::from_env();
        clear_env();
        assert_eq!(config.max_errors, DEFAULT_MAX_ERRORS);
    }
}
