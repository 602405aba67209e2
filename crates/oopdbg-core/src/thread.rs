//! Debuggee threads.
//!
//! A [`DebuggeeThread`] is created when a process-created or thread-created
//! event is dispatched and dropped from the owning process when the matching
//! thread-exit event arrives. Register access goes through the process's
//! [`DebugApi`], so the values are only meaningful while the thread is stopped.

use std::sync::Arc;

use crate::api::{DebugApi, ThreadContext};
use crate::error::Result;
use crate::types::{Address, ProcessId, ThreadId};

/// One execution thread inside the debuggee
///
/// Values returned by [`Debuggee::get_thread`](crate::process::Debuggee::get_thread)
/// are handles onto the record owned by the process: cloning one does not
/// create a new thread.
#[derive(Debug, Clone)]
pub struct DebuggeeThread
{
    id: ThreadId,
    process: ProcessId,
    start_address: Address,
    is_nexe: bool,
    api: Arc<dyn DebugApi>,
}

impl DebuggeeThread
{
    pub(crate) fn new(
        id: ThreadId,
        process: ProcessId,
        start_address: Address,
        is_nexe: bool,
        api: Arc<dyn DebugApi>,
    ) -> Self
    {
        Self {
            id,
            process,
            start_address,
            is_nexe,
            api,
        }
    }

    pub fn id(&self) -> ThreadId
    {
        self.id
    }

    pub fn process_id(&self) -> ProcessId
    {
        self.process
    }

    /// Start address reported by the create event.
    pub fn start_address(&self) -> Address
    {
        self.start_address
    }

    /// Whether the thread started inside the sandboxed payload. Sandbox-relative
    /// pointers are only meaningful for these threads.
    pub fn is_nexe(&self) -> bool
    {
        self.is_nexe
    }

    /// Read the thread's register context.
    pub fn context(&self) -> Result<ThreadContext>
    {
        self.api.get_thread_context(self.process, self.id)
    }

    /// Write the thread's register context.
    pub fn set_context(&self, context: &ThreadContext) -> Result<()>
    {
        self.api.set_thread_context(self.process, self.id, context)
    }

    pub fn instruction_pointer(&self) -> Result<Address>
    {
        Ok(self.context()?.instruction_pointer)
    }

    pub fn set_instruction_pointer(&self, ip: Address) -> Result<()>
    {
        let mut context = self.context()?;
        context.instruction_pointer = ip;
        self.set_context(&context)
    }
}
