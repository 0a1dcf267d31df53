//! # Runtime Configuration
//!
//! Tunables for device access and dispatch. Defaults target a Raspberry Pi
//! with the stock `/dev/vcio` and `/dev/mem` nodes; every field can be
//! overridden from `VC4CL_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use vc4_mailbox::MemFlags;

// =============================================================================
// COMPLETION MODE
// =============================================================================

/// How the engine learns that a dispatch finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Program the user-program queue registers and poll `SRQCS`
    Polling,
    /// Hand the control block to the firmware and block in the mailbox
    Firmware,
}

impl CompletionMode {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "poll" | "polling" | "register" | "registers" => Some(Self::Polling),
            "firmware" | "mailbox" => Some(Self::Firmware),
            _ => None,
        }
    }
}

// =============================================================================
// RUNTIME CONFIG
// =============================================================================

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Completion detection
    pub completion: CompletionMode,
    /// Delay between status register polls (zero spins)
    pub poll_interval: Duration,
    /// Longest a single work-group may run
    pub dispatch_timeout: Duration,
    /// Mailbox character device
    pub mailbox_path: PathBuf,
    /// Physical memory device
    pub mem_path: PathBuf,
    /// Peripheral base; detected from the device tree when unset
    pub peripheral_base: Option<u64>,
    /// Firmware flags for buffer and code allocations
    pub alloc_flags: MemFlags,
    /// Alignment of GPU allocations
    pub alloc_alignment: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::Polling,
            poll_interval: Duration::from_micros(10),
            dispatch_timeout: Duration::from_secs(10),
            mailbox_path: PathBuf::from("/dev/vcio"),
            mem_path: PathBuf::from("/dev/mem"),
            peripheral_base: None,
            alloc_flags: MemFlags::DIRECT | MemFlags::ZERO,
            alloc_alignment: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `VC4CL_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from a key lookup
    ///
    /// Unparsable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("VC4CL_COMPLETION") {
            match CompletionMode::parse(&v) {
                Some(mode) => self.completion = mode,
                None => log::warn!("ignoring VC4CL_COMPLETION={}", v),
            }
        }
        if let Some(v) = lookup("VC4CL_POLL_US") {
            match v.parse() {
                Ok(us) => self.poll_interval = Duration::from_micros(us),
                Err(_) => log::warn!("ignoring VC4CL_POLL_US={}", v),
            }
        }
        if let Some(v) = lookup("VC4CL_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.dispatch_timeout = Duration::from_millis(ms),
                Err(_) => log::warn!("ignoring VC4CL_TIMEOUT_MS={}", v),
            }
        }
        if let Some(v) = lookup("VC4CL_MAILBOX") {
            self.mailbox_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VC4CL_MEM") {
            self.mem_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VC4CL_PERIPHERAL_BASE") {
            let digits = v.trim_start_matches("0x").trim_start_matches("0X");
            match u64::from_str_radix(digits, 16) {
                Ok(base) => self.peripheral_base = Some(base),
                Err(_) => log::warn!("ignoring VC4CL_PERIPHERAL_BASE={}", v),
            }
        }
        self
    }

    /// Dispatch timeout in whole milliseconds, as the firmware takes it
    pub fn timeout_ms(&self) -> u32 {
        self.dispatch_timeout.as_millis().min(u32::MAX as u128) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.completion, CompletionMode::Polling);
        assert_eq!(config.timeout_ms(), 10_000);
        assert!(config.peripheral_base.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::default().with_overrides(lookup(&[
            ("VC4CL_COMPLETION", "firmware"),
            ("VC4CL_TIMEOUT_MS", "250"),
            ("VC4CL_PERIPHERAL_BASE", "0x20000000"),
            ("VC4CL_MAILBOX", "/tmp/vcio"),
        ]));
        assert_eq!(config.completion, CompletionMode::Firmware);
        assert_eq!(config.dispatch_timeout, Duration::from_millis(250));
        assert_eq!(config.peripheral_base, Some(0x2000_0000));
        assert_eq!(config.mailbox_path, PathBuf::from("/tmp/vcio"));
    }

    #[test]
    fn test_bad_overrides_ignored() {
        let config = RuntimeConfig::default().with_overrides(lookup(&[
            ("VC4CL_COMPLETION", "interrupts"),
            ("VC4CL_POLL_US", "soon"),
        ]));
        assert_eq!(config.completion, CompletionMode::Polling);
        assert_eq!(config.poll_interval, Duration::from_micros(10));
    }
}
