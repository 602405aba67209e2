//! Process, thread, and run-state types.

use std::fmt;
use std::str::FromStr;

/// Operating-system process identifier
///
/// Immutable for the lifetime of a [`DebuggeeProcess`](crate::process::DebuggeeProcess)
/// and used as the key of the engine's process registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    pub fn raw(&self) -> u32
    {
        self.0
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// The OS thread id as reported by debug events (Windows thread id, Linux
/// TID). Stored as `u64` so every backend fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    ///
    /// ```rust
    /// use oopdbg_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(12345);
    /// assert_eq!(thread.raw(), 12345);
    /// ```
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Run state of a debuggee process
///
/// ## State Transitions
///
/// - `Running` → `Halted`: a debug event was dispatched for the process
/// - `Halted` → `Running`: `continue_execution`, `continue_and_pass_exception`
///   or `single_step`
/// - `Halted`/`Running` → `Dead`: the process-exit event was dispatched (or
///   the debugger detached)
///
/// `Dead` is terminal. A process object may only be dropped by its registry
/// once it is `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessState
{
    /// Alive; the event loop is waiting for the next debug event.
    #[default]
    Running,
    /// Alive; suspended by a debug event and waiting for a debugger decision.
    Halted,
    /// Gone. No control command succeeds any more.
    Dead,
}

impl ProcessState
{
    pub fn is_dead(&self) -> bool
    {
        *self == Self::Dead
    }
}

impl fmt::Display for ProcessState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            Self::Running => "running",
            Self::Halted => "halted",
            Self::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// CPU architecture of the debuggee
///
/// Selects the trap instruction used for software breakpoints and the native
/// word size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 32-bit x86.
    X86,
    /// x86-64 / AMD64.
    X86_64,
    /// ARM64 / AArch64.
    Arm64,
    /// Anything else, kept by name for error messages.
    Unknown(String),
}

impl Architecture
{
    /// Architecture of the machine running the debugger.
    pub fn host() -> Self
    {
        match std::env::consts::ARCH {
            "x86" => Self::X86,
            "x86_64" => Self::X86_64,
            "aarch64" => Self::Arm64,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Native word size in bits, `None` for unknown architectures.
    pub fn word_size_bits(&self) -> Option<u32>
    {
        match self {
            Self::X86 => Some(32),
            Self::X86_64 | Self::Arm64 => Some(64),
            Self::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::X86 => f.write_str("x86"),
            Self::X86_64 => f.write_str("x86_64"),
            Self::Arm64 => f.write_str("arm64"),
            Self::Unknown(name) => write!(f, "unknown({name})"),
        }
    }
}

impl FromStr for Architecture
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "x86" | "i386" | "i686" | "ia32" => Ok(Self::X86),
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            _ => Err(format!("Unknown architecture: {s}. Use 'x86', 'x86_64' or 'arm64'")),
        }
    }
}
