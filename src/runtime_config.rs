//! Environment-driven runtime configuration.
//!
//! The server spawns one coroutine per accepted connection; the stack size of
//! those coroutines is tunable via `PORTCULLIS_STACK_SIZE`, accepted in
//! decimal (`16384`) or hexadecimal (`0x4000`). Larger stacks support deeper
//! handler call chains, smaller stacks reduce memory per idle connection.

use std::env;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Stack size for connection coroutines in bytes (default: 64 KB / 0x10000)
    pub stack_size: usize,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let stack_size = match env::var("PORTCULLIS_STACK_SIZE") {
            Ok(val) => {
                if let Some(hex) = val.strip_prefix("0x") {
                    usize::from_str_radix(hex, 16).unwrap_or(0x10000)
                } else {
                    val.parse().unwrap_or(0x10000)
                }
            }
            Err(_) => 0x10000,
        };
        RuntimeConfig { stack_size }
    }

    /// Apply this configuration to the `may` coroutine runtime.
    pub fn apply(&self) {
        may::config().set_stack_size(self.stack_size);
    }
}
