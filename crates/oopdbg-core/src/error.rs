//! # Error Types
//!
//! Every control operation on a debuggee reports failure through
//! [`DebuggerError`] instead of panicking. A failed command leaves the process
//! state untouched unless the variant says otherwise.
//!
//! ## Error Categories
//!
//! 1. **State errors**: NotHalted, AlreadyHalted, ProcessDead
//! 2. **Caller errors**: WrongThread, InvalidArgument
//! 3. **Lookup errors**: ProcessNotFound, ThreadNotFound, NoHaltedThread
//! 4. **Breakpoint errors**: BreakpointExists, NoBreakpoint
//! 5. **Memory errors**: MemoryAccess, NoDebugString
//! 6. **Platform errors**: UnsupportedArchitecture, UnsupportedPlatform, Os, Io

use thiserror::Error;

use crate::types::{Address, ProcessId, ProcessState, ThreadId};

/// Main error type for debuggee control operations
#[derive(Error, Debug)]
pub enum DebuggerError
{
    /// The command is only valid while the process is halted.
    ///
    /// Applies to continue, single-step, memory writes, debug string reads and
    /// breakpoint changes. The `state` field carries what the process was in.
    #[error("Process must be halted for this operation (state: {0})")]
    NotHalted(ProcessState),

    /// `break_execution` was issued on a process that is already halted.
    #[error("Process is already halted")]
    AlreadyHalted,

    /// The process has exited (or the debugger detached). No command succeeds.
    #[error("Process {0} is dead")]
    ProcessDead(ProcessId),

    /// A command reserved for the event-loop thread was issued from another thread.
    ///
    /// Continue, pass-exception and single-step resume a thread the OS
    /// considers owned by the thread waiting for debug events.
    #[error("{0} must be called from the debug event loop thread")]
    WrongThread(&'static str),

    /// The process is halted but the thread that caused the halt is gone.
    #[error("No halted thread")]
    NoHaltedThread,

    /// No thread with the given id belongs to the process.
    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),

    /// No process with the given id is registered with the engine.
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// A breakpoint is already installed at the address.
    #[error("Breakpoint already exists at {0}")]
    BreakpointExists(Address),

    /// No breakpoint is installed at the address.
    #[error("No breakpoint at address {0}")]
    NoBreakpoint(Address),

    /// The target range is unmapped, protected, or wraps the address space.
    ///
    /// Nothing was transferred: reads and writes are all-or-nothing.
    #[error("Cannot access {len} bytes at {address}: {reason}")]
    MemoryAccess
    {
        /// Start of the requested range
        address: Address,
        /// Length of the requested range
        len: usize,
        /// What the backend reported
        reason: String,
    },

    /// The last debug event was not an output-string event.
    #[error("Last debug event carries no debug string")]
    NoDebugString,

    /// Software breakpoints need a known trap instruction for the target.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// No debug backend exists for the host operating system.
    #[error("Debugging not supported on platform: {0}")]
    UnsupportedPlatform(String),

    /// Invalid argument passed to a debugger function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An OS debug primitive failed.
    #[error("OS debug API error: {0}")]
    Os(String),

    /// I/O error (procfs access and similar)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebuggerError
{
    /// Shorthand for [`DebuggerError::MemoryAccess`].
    pub fn memory_access(address: Address, len: usize, reason: impl Into<String>) -> Self
    {
        Self::MemoryAccess {
            address,
            len,
            reason: reason.into(),
        }
    }
}

#[cfg(target_os = "linux")]
impl From<nix::errno::Errno> for DebuggerError
{
    fn from(errno: nix::errno::Errno) -> Self
    {
        Self::Os(errno.desc().to_string())
    }
}

/// Convenience type alias for `Result<T, DebuggerError>`
///
/// ```rust
/// use oopdbg_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, DebuggerError>;
