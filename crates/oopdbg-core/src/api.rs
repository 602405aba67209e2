//! # Debug API boundary
//!
//! [`DebugApi`] is the thin binding to the OS process/thread/debug primitives.
//! The process-control core calls it for every OS-level operation and is
//! otherwise OS-agnostic:
//!
//! - **Linux**: `platform::linux::PtraceDebugApi`
//!   (`ptrace`, `/proc/<pid>/mem`, `kill`)
//! - **Tests**: [`MockDebugApi`](crate::mock::MockDebugApi), an in-memory
//!   debuggee with scriptable memory maps and thread contexts
//!
//! ## Contract
//!
//! Every method either completes fully or returns an error. Memory transfers
//! are all-or-nothing: a backend that can only move part of a range must
//! report failure and leave the target unchanged.

use std::fmt;

use crate::error::Result;
use crate::types::{Address, ProcessId, ThreadId};

/// Register state of one thread, reduced to what process control needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadContext
{
    /// Program counter (RIP/EIP/PC)
    pub instruction_pointer: Address,
    /// Stack pointer (RSP/ESP/SP)
    pub stack_pointer: Address,
    /// Flags register (EFLAGS / PSTATE)
    pub flags: u64,
}

/// How a halted thread is released back to the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeAction
{
    /// Resume, discarding any pending exception (`DBG_CONTINUE`).
    Continue,
    /// Resume and let the debuggee handle the pending exception
    /// (`DBG_EXCEPTION_NOT_HANDLED`, or re-delivering the stop signal).
    PassException
    {
        /// Code of the exception being passed on
        code: crate::events::ExceptionCode,
    },
    /// Execute exactly one instruction, then report a single-step exception.
    SingleStep,
}

/// OS debug primitives used by [`DebuggeeProcess`](crate::process::DebuggeeProcess)
///
/// Implementations must be shareable across threads: `break_process`,
/// `terminate` and `detach` may be called from any thread while the event
/// loop thread blocks waiting for the next event. A backend whose OS binds the
/// debuggee to one thread may refuse `detach` elsewhere with
/// [`WrongThread`](crate::error::DebuggerError::WrongThread).
pub trait DebugApi: Send + Sync + fmt::Debug
{
    /// Copy `buf.len()` bytes from `addr` in the debuggee into `buf`.
    fn read_memory(&self, pid: ProcessId, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into the debuggee at `addr`, code pages included.
    fn write_memory(&self, pid: ProcessId, addr: Address, data: &[u8]) -> Result<()>;

    /// Make instruction fetches observe a code patch. No-op where the OS
    /// keeps caches coherent for debugger writes.
    fn flush_instruction_cache(&self, _pid: ProcessId, _addr: Address, _len: usize) -> Result<()>
    {
        Ok(())
    }

    /// Read the register context of a stopped thread.
    fn get_thread_context(&self, pid: ProcessId, thread: ThreadId) -> Result<ThreadContext>;

    /// Write the register context of a stopped thread.
    fn set_thread_context(&self, pid: ProcessId, thread: ThreadId, context: &ThreadContext) -> Result<()>;

    /// Release the thread that reported the current debug event.
    fn resume(&self, pid: ProcessId, thread: ThreadId, action: ResumeAction) -> Result<()>;

    /// Ask a running debuggee to stop and report a breakpoint exception.
    fn break_process(&self, pid: ProcessId) -> Result<()>;

    /// Terminate every thread of the debuggee. The exit is reported later as a
    /// process-exit event.
    fn terminate(&self, pid: ProcessId, exit_code: u32) -> Result<()>;

    /// Stop debugging the process without killing it.
    fn detach(&self, pid: ProcessId) -> Result<()>;

    /// `true` for a 32-bit process running on a 64-bit OS.
    fn is_wow64(&self, _pid: ProcessId) -> Result<bool>
    {
        Ok(false)
    }
}
