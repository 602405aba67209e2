//! Debug event types.
//!
//! A [`DebugEvent`] is one notification delivered by the OS debug loop. The
//! event source (a platform backend or a scripted test source) builds them and
//! the [`ExecutionEngine`](crate::engine::ExecutionEngine) hands each one to
//! the owning process. Events are immutable once built.

use std::fmt;

use crate::types::{Address, ProcessId, ThreadId};

/// Exception code attached to an exception event
///
/// Codes follow the Windows `EXCEPTION_*` numbering. Backends without
/// exception codes (ptrace) map breakpoint and single-step traps onto
/// [`ExceptionCode::BREAKPOINT`] / [`ExceptionCode::SINGLE_STEP`] and encode
/// every other stop signal with [`ExceptionCode::from_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode
{
    /// Trap instruction executed (`EXCEPTION_BREAKPOINT`).
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    /// Trace trap after a single step (`EXCEPTION_SINGLE_STEP`).
    pub const SINGLE_STEP: Self = Self(0x8000_0004);
    /// Invalid memory access (`EXCEPTION_ACCESS_VIOLATION`).
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);

    const SIGNAL_TAG: u32 = 0xE100_0000;
    const SIGNAL_MASK: u32 = 0x0000_FFFF;

    /// Encode a POSIX stop signal as an exception code.
    pub const fn from_signal(signo: i32) -> Self
    {
        Self(Self::SIGNAL_TAG | (signo as u32 & Self::SIGNAL_MASK))
    }

    /// The POSIX signal this code was encoded from, if any.
    pub fn signal(self) -> Option<i32>
    {
        if self.0 & !Self::SIGNAL_MASK == Self::SIGNAL_TAG {
            i32::try_from(self.0 & Self::SIGNAL_MASK).ok()
        } else {
            None
        }
    }

    pub fn is_breakpoint(self) -> bool
    {
        self == Self::BREAKPOINT
    }

    pub fn is_single_step(self) -> bool
    {
        self == Self::SINGLE_STEP
    }
}

impl fmt::Display for ExceptionCode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match *self {
            Self::BREAKPOINT => f.write_str("breakpoint"),
            Self::SINGLE_STEP => f.write_str("single step"),
            Self::ACCESS_VIOLATION => f.write_str("access violation"),
            code => match code.signal() {
                Some(signo) => write!(f, "signal {signo}"),
                None => write!(f, "0x{:08x}", code.0),
            },
        }
    }
}

/// Event delivered by the OS debug loop for one debuggee process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent
{
    /// The debuggee was created or attached; `thread` is its initial thread.
    ProcessCreated
    {
        pid: ProcessId,
        thread: ThreadId,
        /// Base of the main executable image
        image_base: Address,
        /// Start address of the initial thread
        start_address: Address,
    },
    /// The debuggee exited. Always the last event for a process.
    ProcessExited
    {
        pid: ProcessId,
        thread: ThreadId,
        exit_code: u32,
    },
    /// A new thread started.
    ThreadCreated
    {
        pid: ProcessId,
        thread: ThreadId,
        start_address: Address,
    },
    /// A thread exited.
    ThreadExited
    {
        pid: ProcessId,
        thread: ThreadId,
        exit_code: u32,
    },
    /// A thread raised an exception (breakpoint, single step, fault, signal).
    Exception
    {
        pid: ProcessId,
        thread: ThreadId,
        code: ExceptionCode,
        /// Faulting address; for breakpoints, the address of the trap instruction
        address: Address,
        /// `false` when the debuggee already had a chance to handle it
        first_chance: bool,
    },
    /// The debuggee emitted a debug string. The bytes stay in debuggee memory
    /// until read with `read_debug_string`.
    OutputString
    {
        pid: ProcessId,
        thread: ThreadId,
        address: Address,
        length: usize,
    },
    /// A module (shared library / DLL) was mapped.
    ModuleLoaded
    {
        pid: ProcessId,
        thread: ThreadId,
        base: Address,
        name: Option<String>,
    },
}

impl DebugEvent
{
    /// Process the event belongs to.
    pub fn pid(&self) -> ProcessId
    {
        match self {
            Self::ProcessCreated { pid, .. }
            | Self::ProcessExited { pid, .. }
            | Self::ThreadCreated { pid, .. }
            | Self::ThreadExited { pid, .. }
            | Self::Exception { pid, .. }
            | Self::OutputString { pid, .. }
            | Self::ModuleLoaded { pid, .. } => *pid,
        }
    }

    /// Thread that reported the event.
    pub fn thread(&self) -> ThreadId
    {
        match self {
            Self::ProcessCreated { thread, .. }
            | Self::ProcessExited { thread, .. }
            | Self::ThreadCreated { thread, .. }
            | Self::ThreadExited { thread, .. }
            | Self::Exception { thread, .. }
            | Self::OutputString { thread, .. }
            | Self::ModuleLoaded { thread, .. } => *thread,
        }
    }

    /// Exception code, for exception events.
    pub fn exception_code(&self) -> Option<ExceptionCode>
    {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::ProcessCreated {
                pid, thread, image_base, ..
            } => format!("Process {pid} created (thread {thread}, image at {image_base})"),
            Self::ProcessExited { pid, exit_code, .. } => format!("Process {pid} exited with code {exit_code}"),
            Self::ThreadCreated {
                thread, start_address, ..
            } => format!("Thread {thread} created at {start_address}"),
            Self::ThreadExited { thread, exit_code, .. } => format!("Thread {thread} exited with code {exit_code}"),
            Self::Exception {
                thread,
                code,
                address,
                first_chance,
                ..
            } => {
                let chance = if *first_chance { "first" } else { "second" };
                format!("Thread {thread}: {code} at {address} ({chance} chance)")
            }
            Self::OutputString { thread, length, .. } => format!("Thread {thread}: debug string ({length} bytes)"),
            Self::ModuleLoaded { base, name, .. } => {
                format!("Module {} loaded at {base}", name.as_deref().unwrap_or("<unnamed>"))
            }
        }
    }
}

impl fmt::Display for DebugEvent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(&self.describe())
    }
}
