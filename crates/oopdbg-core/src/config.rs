//! # Configuration
//!
//! Per-process and engine settings. Values come from builder calls or from
//! the environment:
//!
//! - `OOPDBG_ARCH`: target architecture (`x86`, `x86_64`, `arm64`); defaults
//!   to the host architecture
//! - `OOPDBG_COMPAT_MODE`: `1`/`true` rewinds the instruction pointer past the
//!   trap on breakpoint hits
//! - `OOPDBG_SANDBOX_SIZE`: size of the sandboxed payload's address range
//!   (decimal or `0x` hex), default 4 GiB
//! - `OOPDBG_POLL_INTERVAL_MS`: event wait slice used by the engine

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::types::Architecture;

/// Address range reserved for a sandboxed payload (4 GiB).
pub const DEFAULT_SANDBOX_SIZE: u64 = 1 << 32;

/// Settings applied to every [`DebuggeeProcess`](crate::process::DebuggeeProcess)
/// the engine creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig
{
    /// Target architecture; selects the trap instruction and word size.
    pub architecture: Architecture,
    /// Rewind the instruction pointer by the trap width on breakpoint hits.
    pub compatibility_mode: bool,
    /// Length of the sandbox range starting at the nexe memory base.
    pub sandbox_size: u64,
}

impl Default for ProcessConfig
{
    fn default() -> Self
    {
        Self {
            architecture: Architecture::host(),
            compatibility_mode: false,
            sandbox_size: DEFAULT_SANDBOX_SIZE,
        }
    }
}

impl ProcessConfig
{
    /// Defaults overridden by `OOPDBG_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Ok(arch) = env::var("OOPDBG_ARCH") {
            match arch.parse() {
                Ok(architecture) => config.architecture = architecture,
                Err(e) => warn!("Ignoring OOPDBG_ARCH: {e}"),
            }
        }
        if let Ok(flag) = env::var("OOPDBG_COMPAT_MODE") {
            config.compatibility_mode = parse_flag(&flag);
        }
        if let Ok(size) = env::var("OOPDBG_SANDBOX_SIZE") {
            match parse_u64(&size) {
                Some(size) if size > 0 => config.sandbox_size = size,
                _ => warn!("Ignoring OOPDBG_SANDBOX_SIZE: {size:?}"),
            }
        }
        config
    }

    #[must_use]
    pub fn with_architecture(mut self, architecture: Architecture) -> Self
    {
        self.architecture = architecture;
        self
    }

    #[must_use]
    pub fn with_compatibility_mode(mut self, enabled: bool) -> Self
    {
        self.compatibility_mode = enabled;
        self
    }

    #[must_use]
    pub fn with_sandbox_size(mut self, size: u64) -> Self
    {
        self.sandbox_size = size;
        self
    }
}

/// Settings for the [`ExecutionEngine`](crate::engine::ExecutionEngine) wait loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig
{
    /// How long a single wait on the event source may block.
    pub poll_interval: Duration,
    /// Configuration for processes created from process-created events.
    pub process: ProcessConfig,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            poll_interval: Duration::from_millis(100),
            process: ProcessConfig::default(),
        }
    }
}

impl EngineConfig
{
    /// Engine defaults plus [`ProcessConfig::from_env`].
    pub fn from_env() -> Self
    {
        let mut config = Self {
            process: ProcessConfig::from_env(),
            ..Self::default()
        };
        if let Ok(ms) = env::var("OOPDBG_POLL_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                Err(e) => warn!("Ignoring OOPDBG_POLL_INTERVAL_MS: {e}"),
            }
        }
        config
    }
}

fn parse_flag(value: &str) -> bool
{
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(value: &str) -> Option<u64>
{
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
