//! # In-memory debug backend
//!
//! Deterministic stand-ins for the OS collaborators, used to exercise the
//! state machine and breakpoint logic without a live debuggee:
//!
//! - [`MockDebugApi`]: a [`DebugApi`] with a sparse memory map, per-thread
//!   register contexts and a log of every control call
//! - [`ScriptedEventSource`]: a [`DebugEventSource`] that replays queued events
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use oopdbg_core::mock::MockDebugApi;
//! use oopdbg_core::types::Address;
//!
//! let api = Arc::new(MockDebugApi::new());
//! api.map_region(Address::new(0x4000), vec![0x90; 16], true);
//! assert_eq!(api.peek(Address::new(0x4000), 2), Some(vec![0x90, 0x90]));
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::api::{DebugApi, ResumeAction, ThreadContext};
use crate::engine::DebugEventSource;
use crate::error::{DebuggerError, Result};
use crate::events::DebugEvent;
use crate::types::{Address, ProcessId, ThreadId};

/// A control call recorded by [`MockDebugApi`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall
{
    Resume
    {
        thread: ThreadId,
        action: ResumeAction,
    },
    SetThreadContext
    {
        thread: ThreadId,
        context: ThreadContext,
    },
    FlushInstructionCache
    {
        address: Address,
        len: usize,
    },
    BreakProcess,
    Terminate
    {
        exit_code: u32,
    },
    Detach,
}

#[derive(Debug)]
struct Region
{
    data: Vec<u8>,
    writable: bool,
}

#[derive(Debug, Default)]
struct MockState
{
    regions: BTreeMap<Address, Region>,
    contexts: HashMap<ThreadId, ThreadContext>,
    calls: Vec<ApiCall>,
    is_wow64: bool,
    fail_resume: bool,
    fail_detach: bool,
}

impl MockState
{
    /// Region containing all of `[addr, addr + len)`, with the offset of `addr`.
    fn region_for(&mut self, addr: Address, len: usize) -> Result<(&mut Region, usize)>
    {
        let (start, region) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| DebuggerError::memory_access(addr, len, "unmapped"))?;
        let offset = usize::try_from(addr.value() - start.value()).unwrap_or(usize::MAX);
        match offset.checked_add(len) {
            Some(end) if end <= region.data.len() => Ok((region, offset)),
            _ => Err(DebuggerError::memory_access(addr, len, "unmapped")),
        }
    }
}

/// Simulated debuggee address space and thread set
///
/// Memory is a set of non-overlapping regions; a transfer must fall inside a
/// single region or it fails without touching anything. Control calls succeed
/// (unless told to fail) and are appended to [`calls`](Self::calls).
#[derive(Debug, Default)]
pub struct MockDebugApi
{
    state: Mutex<MockState>,
}

impl MockDebugApi
{
    pub fn new() -> Self
    {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map `data` at `addr`, replacing any region that starts there.
    pub fn map_region(&self, addr: Address, data: Vec<u8>, writable: bool)
    {
        self.lock().regions.insert(addr, Region { data, writable });
    }

    /// Current bytes at `[addr, addr + len)`, bypassing every check but mapping.
    pub fn peek(&self, addr: Address, len: usize) -> Option<Vec<u8>>
    {
        let mut state = self.lock();
        let (region, offset) = state.region_for(addr, len).ok()?;
        Some(region.data[offset..offset + len].to_vec())
    }

    /// Give `thread` a register context.
    pub fn set_context(&self, thread: ThreadId, context: ThreadContext)
    {
        self.lock().contexts.insert(thread, context);
    }

    pub fn context(&self, thread: ThreadId) -> Option<ThreadContext>
    {
        self.lock().contexts.get(&thread).copied()
    }

    /// Report every process as a WoW64 process from now on.
    pub fn set_wow64(&self, is_wow64: bool)
    {
        self.lock().is_wow64 = is_wow64;
    }

    /// Make subsequent `resume` calls fail.
    pub fn set_fail_resume(&self, fail: bool)
    {
        self.lock().fail_resume = fail;
    }

    /// Make subsequent `detach` calls fail.
    pub fn set_fail_detach(&self, fail: bool)
    {
        self.lock().fail_detach = fail;
    }

    /// Every control call so far, oldest first.
    pub fn calls(&self) -> Vec<ApiCall>
    {
        self.lock().calls.clone()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<ApiCall>
    {
        std::mem::take(&mut self.lock().calls)
    }

    /// Resume calls only, in order.
    pub fn resumes(&self) -> Vec<(ThreadId, ResumeAction)>
    {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ApiCall::Resume { thread, action } => Some((*thread, *action)),
                _ => None,
            })
            .collect()
    }
}

impl DebugApi for MockDebugApi
{
    fn read_memory(&self, _pid: ProcessId, addr: Address, buf: &mut [u8]) -> Result<()>
    {
        let mut state = self.lock();
        let (region, offset) = state.region_for(addr, buf.len())?;
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_memory(&self, _pid: ProcessId, addr: Address, data: &[u8]) -> Result<()>
    {
        let mut state = self.lock();
        let (region, offset) = state.region_for(addr, data.len())?;
        if !region.writable {
            return Err(DebuggerError::memory_access(addr, data.len(), "write protected"));
        }
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_instruction_cache(&self, _pid: ProcessId, addr: Address, len: usize) -> Result<()>
    {
        self.lock()
            .calls
            .push(ApiCall::FlushInstructionCache { address: addr, len });
        Ok(())
    }

    fn get_thread_context(&self, _pid: ProcessId, thread: ThreadId) -> Result<ThreadContext>
    {
        self.lock()
            .contexts
            .get(&thread)
            .copied()
            .ok_or(DebuggerError::ThreadNotFound(thread))
    }

    fn set_thread_context(&self, _pid: ProcessId, thread: ThreadId, context: &ThreadContext) -> Result<()>
    {
        let mut state = self.lock();
        if !state.contexts.contains_key(&thread) {
            return Err(DebuggerError::ThreadNotFound(thread));
        }
        state.contexts.insert(thread, *context);
        state.calls.push(ApiCall::SetThreadContext {
            thread,
            context: *context,
        });
        Ok(())
    }

    fn resume(&self, _pid: ProcessId, thread: ThreadId, action: ResumeAction) -> Result<()>
    {
        let mut state = self.lock();
        if state.fail_resume {
            return Err(DebuggerError::Os("resume refused".to_string()));
        }
        state.calls.push(ApiCall::Resume { thread, action });
        Ok(())
    }

    fn break_process(&self, _pid: ProcessId) -> Result<()>
    {
        self.lock().calls.push(ApiCall::BreakProcess);
        Ok(())
    }

    fn terminate(&self, _pid: ProcessId, exit_code: u32) -> Result<()>
    {
        self.lock().calls.push(ApiCall::Terminate { exit_code });
        Ok(())
    }

    fn detach(&self, _pid: ProcessId) -> Result<()>
    {
        let mut state = self.lock();
        if state.fail_detach {
            return Err(DebuggerError::Os("detach refused".to_string()));
        }
        state.calls.push(ApiCall::Detach);
        Ok(())
    }

    fn is_wow64(&self, _pid: ProcessId) -> Result<bool>
    {
        Ok(self.lock().is_wow64)
    }
}

/// Event source that hands out queued events in order
#[derive(Debug, Default)]
pub struct ScriptedEventSource
{
    queue: VecDeque<DebugEvent>,
}

impl ScriptedEventSource
{
    pub fn new<I>(events: I) -> Self
    where
        I: IntoIterator<Item = DebugEvent>,
    {
        Self {
            queue: events.into_iter().collect(),
        }
    }

    pub fn push(&mut self, event: DebugEvent)
    {
        self.queue.push_back(event);
    }

    pub fn remaining(&self) -> usize
    {
        self.queue.len()
    }
}

impl DebugEventSource for ScriptedEventSource
{
    /// Never blocks: an empty queue behaves like a timed-out wait.
    fn wait_for_debug_event(&mut self, _timeout: Duration) -> Result<Option<DebugEvent>>
    {
        Ok(self.queue.pop_front())
    }
}
