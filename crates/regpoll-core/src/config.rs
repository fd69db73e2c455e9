use crate::error::ConfigError;
use crate::register::{RegisterKey, RegisterSpace};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    /// Registers to poll, in read order.
    pub registers: Vec<RegisterKey>,
    pub space: RegisterSpace,
    pub interval: Duration,
    /// Bound on each connect, read and write.
    pub read_timeout: Duration,
    /// Restart the interval timer after an on-demand cycle.
    pub reset_interval_on_refresh: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            registers: Vec::new(),
            space: RegisterSpace::Input,
            interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(2),
            reset_interval_on_refresh: false,
        }
    }
}

impl PollConfig {
    pub fn new(registers: impl Into<Vec<RegisterKey>>) -> Self {
        Self {
            registers: registers.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registers.is_empty() {
            return Err(ConfigError::NoRegisters);
        }
        let mut seen = HashSet::with_capacity(self.registers.len());
        for &key in &self.registers {
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateRegister(key));
            }
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll interval"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("read timeout"));
        }
        Ok(())
    }
}
