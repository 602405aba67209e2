//! # Debuggee process control
//!
//! [`Debuggee`] is the public control surface for one debuggee process and
//! [`DebuggeeProcess`] is its implementation on top of a [`DebugApi`].
//!
//! ## Run state
//!
//! The debuggee only moves when the OS delivers a debug event. Every event
//! dispatched by the [`ExecutionEngine`](crate::engine::ExecutionEngine)
//! halts the process; the process-exit event makes it `Dead`. Commands check
//! the state before touching the OS:
//!
//! | Command                                   | Required state | Caller                 |
//! |-------------------------------------------|----------------|------------------------|
//! | continue / pass exception / single step   | Halted         | event-loop thread      |
//! | break                                     | Running        | any                    |
//! | kill / detach                             | not Dead       | any                    |
//! | read memory                               | not Dead       | any                    |
//! | write memory, debug string, breakpoints   | Halted         | any                    |
//!
//! The event-loop thread is the thread that created the process object.
//! Detach goes through the backend, which may restrict it to that thread too.
//! A failed detach leaves breakpoints armed and the process attached.
//!
//! ## Dispatch boundary
//!
//! Event dispatch and the nexe layout setters are `pub(crate)`: only the
//! engine, which owns the wait loop and the loader hook, can drive them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, trace, warn};

use crate::api::{DebugApi, ResumeAction};
use crate::breakpoints::{trap_instruction, Breakpoint, BreakpointTable};
use crate::config::ProcessConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{DebugEvent, ExceptionCode};
use crate::thread::DebuggeeThread;
use crate::types::{Address, Architecture, ProcessId, ProcessState, ThreadId};

/// Exit code reported to the OS by [`Debuggee::kill`].
pub const KILL_EXIT_CODE: u32 = 1;

/// Longest debug string [`Debuggee::read_debug_string`] will transfer.
pub const MAX_DEBUG_STRING_LEN: usize = 1 << 20;

/// Public control interface of a debuggee process
///
/// Every fallible operation returns `Err` instead of panicking when its
/// preconditions do not hold, leaving the process unchanged.
pub trait Debuggee: Send + Sync
{
    /// OS process identifier.
    fn id(&self) -> ProcessId;

    fn state(&self) -> ProcessState;

    fn is_halted(&self) -> bool
    {
        self.state() == ProcessState::Halted
    }

    /// Rewind the instruction pointer to the trap address on breakpoint hits,
    /// before the event becomes visible to callers. Without it the halted
    /// thread still points past the trap and is moved back when resumed.
    fn enable_compatibility_mode(&self);

    fn compatibility_mode(&self) -> bool;

    /// Snapshot of the most recently dispatched debug event.
    fn last_debug_event(&self) -> Option<DebugEvent>;

    /// Where the sandboxed payload is loaded, or [`Address::ZERO`] before the
    /// loader reported it.
    fn nexe_mem_base(&self) -> Address;

    /// Code address of the payload's `_start`, or [`Address::ZERO`].
    fn nexe_entry_point(&self) -> Address;

    /// Word size of the debuggee: 32 or 64.
    fn word_size_bits(&self) -> u32;

    /// `true` for a 32-bit process on a 64-bit OS.
    fn is_wow(&self) -> bool;

    /// Resume the halted thread.
    fn continue_execution(&self) -> Result<()>;

    /// Resume the halted thread, handing a pending exception to the debuggee.
    /// Same as [`continue_execution`](Self::continue_execution) when the halt
    /// was not caused by an exception.
    fn continue_and_pass_exception(&self) -> Result<()>;

    /// Execute one instruction on the halted thread. The process reports
    /// `Running` until the single-step exception is dispatched.
    fn single_step(&self) -> Result<()>;

    /// Ask a running process to stop. The halt itself arrives as an event.
    fn break_execution(&self) -> Result<()>;

    /// Terminate the process. It becomes `Dead` once the exit event is dispatched.
    fn kill(&self) -> Result<()>;

    /// Remove all breakpoints and stop debugging the process without killing it.
    fn detach(&self) -> Result<()>;

    fn get_thread(&self, id: ThreadId) -> Option<DebuggeeThread>;

    /// Thread that caused the current halt; `None` unless halted.
    fn get_halted_thread(&self) -> Option<DebuggeeThread>;

    /// Ids of all live threads in ascending order.
    fn get_thread_ids(&self) -> Vec<ThreadId>;

    /// Fill `buf` from debuggee memory at `addr`. Bytes under an active
    /// breakpoint read as the original code, not the trap.
    ///
    /// Meant for a halted process; reading a running one is allowed but the
    /// contents may be torn.
    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Like [`read_memory`](Self::read_memory) but returns the patched image,
    /// trap bytes included.
    fn read_memory_raw(&self, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `addr`, all or nothing. Writing over an active
    /// breakpoint updates its saved original code and keeps the trap armed.
    fn write_memory(&self, addr: Address, data: &[u8]) -> Result<()>;

    /// Read the string announced by the last output-string event.
    fn read_debug_string(&self) -> Result<String>;

    /// Patch a trap instruction at `addr`.
    ///
    /// Fails if the process is not halted, `addr` is not readable and
    /// writable, or a breakpoint already exists there.
    fn set_breakpoint(&self, addr: Address) -> Result<()>;

    /// Restore the original code at `addr`. Fails with
    /// [`DebuggerError::NoBreakpoint`] if there is no breakpoint there.
    fn remove_breakpoint(&self, addr: Address) -> Result<()>;

    fn get_breakpoint(&self, addr: Address) -> Option<Breakpoint>;

    /// All breakpoints in ascending address order.
    fn get_breakpoints(&self) -> Vec<Breakpoint>;

    /// Convert a sandbox-relative pointer into a flat address by adding the
    /// nexe memory base.
    ///
    /// Safe to call on any address: it is the identity when no payload is
    /// loaded, when `ptr` already lies inside the sandbox range
    /// `[base, base + sandbox_size)`, or when `ptr` is too large to be
    /// sandbox-relative. Applying it to its own output changes nothing.
    ///
    /// Real sandbox bases are aligned to the sandbox size. With a smaller base
    /// the two ranges overlap, and relative pointers in `[base, sandbox_size)`
    /// are taken as already flat.
    fn nexe_to_flat_address(&self, ptr: Address) -> Address;

    /// OS primitives this process is driven through.
    fn debug_api(&self) -> &Arc<dyn DebugApi>;
}

/// What dispatching one event did to the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome
{
    /// The process is halted and waits for a command.
    Halted,
    /// The event finished an internal breakpoint step-over and the process
    /// was resumed without surfacing it.
    Resumed,
    /// The process exit was recorded; the process is `Dead`.
    Exited,
    /// The process was already dead; the event was dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct StepOver
{
    address: Address,
    halt_after: bool,
}

#[derive(Debug)]
struct Inner
{
    state: ProcessState,
    compatibility_mode: bool,
    last_debug_event: Option<DebugEvent>,
    halted_thread: Option<ThreadId>,
    nexe_mem_base: Address,
    nexe_entry_point: Address,
    threads: BTreeMap<ThreadId, DebuggeeThread>,
    breakpoints: BreakpointTable,
    step_overs: BTreeMap<ThreadId, StepOver>,
    /// Breakpoint each halted thread trapped on while its IP may still point
    /// past the trap.
    trap_hits: BTreeMap<ThreadId, Address>,
}

/// A debuggee process driven through a [`DebugApi`]
///
/// Owns the process's threads and breakpoints. All mutable state sits behind
/// one lock, so commands from other threads serialize against event dispatch.
/// The engine registry owns each instance; it is never cloned.
#[derive(Debug)]
pub struct DebuggeeProcess
{
    id: ProcessId,
    api: Arc<dyn DebugApi>,
    architecture: Architecture,
    word_size_bits: u32,
    is_wow: bool,
    sandbox_size: u64,
    event_loop_thread: thread::ThreadId,
    inner: Mutex<Inner>,
}

impl DebuggeeProcess
{
    /// Create a `Running` process object. The calling thread becomes the
    /// event-loop thread.
    ///
    /// ## Errors
    ///
    /// - `UnsupportedArchitecture`: no trap instruction or word size for the
    ///   configured architecture
    /// - whatever the API reports for the WoW64 query
    pub fn new(id: ProcessId, api: Arc<dyn DebugApi>, config: &ProcessConfig) -> Result<Self>
    {
        let trap = trap_instruction(&config.architecture)?;
        let is_wow = api.is_wow64(id)?;
        let word_size_bits = if is_wow {
            32
        } else {
            config.architecture.word_size_bits().ok_or_else(|| {
                DebuggerError::UnsupportedArchitecture(format!("unknown word size for {}", config.architecture))
            })?
        };

        debug!(pid = %id, arch = %config.architecture, is_wow, "debuggee process created");
        Ok(Self {
            id,
            api,
            architecture: config.architecture.clone(),
            word_size_bits,
            is_wow,
            sandbox_size: config.sandbox_size,
            event_loop_thread: thread::current().id(),
            inner: Mutex::new(Inner {
                state: ProcessState::Running,
                compatibility_mode: config.compatibility_mode,
                last_debug_event: None,
                halted_thread: None,
                nexe_mem_base: Address::ZERO,
                nexe_entry_point: Address::ZERO,
                threads: BTreeMap::new(),
                breakpoints: BreakpointTable::new(trap),
                step_overs: BTreeMap::new(),
                trap_hits: BTreeMap::new(),
            }),
        })
    }

    pub fn architecture(&self) -> &Architecture
    {
        &self.architecture
    }

    pub fn sandbox_size(&self) -> u64
    {
        self.sandbox_size
    }

    fn lock(&self) -> MutexGuard<'_, Inner>
    {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_alive(&self, inner: &Inner) -> Result<()>
    {
        if inner.state == ProcessState::Dead {
            return Err(DebuggerError::ProcessDead(self.id));
        }
        Ok(())
    }

    fn require_halted(&self, inner: &Inner) -> Result<()>
    {
        self.require_alive(inner)?;
        if inner.state != ProcessState::Halted {
            return Err(DebuggerError::NotHalted(inner.state));
        }
        Ok(())
    }

    fn require_event_loop_thread(&self, operation: &'static str) -> Result<()>
    {
        if thread::current().id() != self.event_loop_thread {
            return Err(DebuggerError::WrongThread(operation));
        }
        Ok(())
    }

    fn check_range(addr: Address, len: usize) -> Result<()>
    {
        if addr.range_end(len).is_none() {
            return Err(DebuggerError::memory_access(addr, len, "range wraps the address space"));
        }
        Ok(())
    }

    fn is_in_sandbox(&self, inner: &Inner, addr: Address) -> bool
    {
        !inner.nexe_mem_base.is_zero() && addr.is_within(inner.nexe_mem_base, self.sandbox_size)
    }

    fn add_thread(&self, inner: &mut Inner, id: ThreadId, start_address: Address)
    {
        let is_nexe = self.is_in_sandbox(inner, start_address);
        let record = DebuggeeThread::new(id, self.id, start_address, is_nexe, Arc::clone(&self.api));
        if inner.threads.insert(id, record).is_some() {
            warn!(pid = %self.id, tid = %id, "thread created twice; record replaced");
        } else {
            trace!(pid = %self.id, tid = %id, is_nexe, "thread added");
        }
    }

    fn write_code(&self, addr: Address, bytes: &[u8]) -> Result<()>
    {
        self.api.write_memory(self.id, addr, bytes)?;
        self.api.flush_instruction_cache(self.id, addr, bytes.len())
    }

    fn read_masked(&self, inner: &Inner, addr: Address, buf: &mut [u8]) -> Result<()>
    {
        Self::check_range(addr, buf.len())?;
        self.api.read_memory(self.id, addr, buf)?;
        inner.breakpoints.mask_original(addr, buf);
        Ok(())
    }

    /// Release the halted thread, stepping over an armed breakpoint first if
    /// the thread sits on one.
    ///
    /// A thread halted by a breakpoint is moved back onto the trap address
    /// first, so it re-executes the original instruction from its start.
    fn resume_halted(&self, inner: &mut Inner, action: ResumeAction) -> Result<()>
    {
        let thread = inner.halted_thread.ok_or(DebuggerError::NoHaltedThread)?;

        if !matches!(action, ResumeAction::PassException { .. }) {
            let hit = inner.trap_hits.get(&thread).copied();
            if let Some(address) = hit {
                self.rewind_past_trap(inner, thread, address)?;
            }
        }

        if let Some(address) = self.breakpoint_under_thread(inner, thread, action) {
            let original = inner
                .breakpoints
                .get(address)
                .map(|bp| bp.original_bytes().to_vec())
                .unwrap_or_default();
            self.write_code(address, &original)?;
            if let Err(e) = self.api.resume(self.id, thread, ResumeAction::SingleStep) {
                let trap = inner.breakpoints.trap().to_vec();
                if let Err(rearm) = self.write_code(address, &trap) {
                    warn!(pid = %self.id, %address, "failed to re-arm breakpoint: {rearm}");
                }
                return Err(e);
            }
            inner.step_overs.insert(
                thread,
                StepOver {
                    address,
                    halt_after: action == ResumeAction::SingleStep,
                },
            );
            debug!(pid = %self.id, tid = %thread, %address, "stepping over breakpoint");
        } else {
            self.api.resume(self.id, thread, action)?;
        }

        inner.trap_hits.remove(&thread);
        inner.state = ProcessState::Running;
        inner.halted_thread = None;
        Ok(())
    }

    /// Address of the armed breakpoint the halted thread would execute next.
    fn breakpoint_under_thread(&self, inner: &Inner, thread: ThreadId, action: ResumeAction) -> Option<Address>
    {
        if matches!(action, ResumeAction::PassException { .. }) || inner.breakpoints.is_empty() {
            return None;
        }
        let record = inner.threads.get(&thread)?;
        match record.instruction_pointer() {
            Ok(ip) if inner.breakpoints.contains(ip) => Some(ip),
            Ok(_) => None,
            Err(e) => {
                trace!(pid = %self.id, tid = %thread, "no context for step-over check: {e}");
                None
            }
        }
    }

    /// Re-arm the trap behind a finished step-over. Returns whether the
    /// process should halt for the event.
    fn finish_step_over(&self, inner: &mut Inner, thread: ThreadId, step: StepOver) -> bool
    {
        let still_stepping = inner.step_overs.values().any(|other| other.address == step.address);
        if inner.breakpoints.contains(step.address) && !still_stepping {
            let trap = inner.breakpoints.trap().to_vec();
            if let Err(e) = self.write_code(step.address, &trap) {
                warn!(pid = %self.id, address = %step.address, "failed to re-arm breakpoint: {e}");
            }
        }
        if step.halt_after {
            return true;
        }
        match self.api.resume(self.id, thread, ResumeAction::Continue) {
            Ok(()) => {
                trace!(pid = %self.id, tid = %thread, "step-over finished, continuing");
                false
            }
            Err(e) => {
                warn!(pid = %self.id, tid = %thread, "continue after step-over failed: {e}");
                true
            }
        }
    }

    /// Rewind the halted thread onto the trap it just executed. No-op unless
    /// the IP sits right behind the trap at `address`.
    fn rewind_past_trap(&self, inner: &Inner, thread: ThreadId, address: Address) -> Result<()>
    {
        let record = inner.threads.get(&thread).ok_or(DebuggerError::ThreadNotFound(thread))?;
        let trap_len = inner.breakpoints.trap().len() as u64;
        if record.instruction_pointer()? == address + trap_len {
            record.set_instruction_pointer(address)?;
            trace!(pid = %self.id, tid = %thread, %address, "instruction pointer rewound onto trap");
        }
        Ok(())
    }

    /// Handle one debug event for this process.
    ///
    /// Bookkeeping happens in this order: thread table, last event, stop
    /// handling (halted thread, breakpoint hits), and finally the `Dead`
    /// transition for process exit.
    pub(crate) fn on_debug_event(&self, event: &DebugEvent) -> DispatchOutcome
    {
        let mut inner = self.lock();
        if inner.state == ProcessState::Dead {
            warn!(pid = %self.id, "event for dead process dropped: {event}");
            return DispatchOutcome::Ignored;
        }
        if inner.state == ProcessState::Halted {
            warn!(pid = %self.id, "event dispatched while halted: {event}");
        }

        let thread = event.thread();
        match event {
            DebugEvent::ProcessCreated { start_address, .. } | DebugEvent::ThreadCreated { start_address, .. } => {
                self.add_thread(&mut inner, thread, *start_address);
            }
            DebugEvent::ThreadExited { .. } => {
                inner.threads.remove(&thread);
                inner.trap_hits.remove(&thread);
                if let Some(step) = inner.step_overs.remove(&thread) {
                    self.finish_step_over(&mut inner, thread, StepOver { halt_after: true, ..step });
                }
            }
            DebugEvent::ProcessExited { .. } => {}
            _ if !inner.threads.contains_key(&thread) => {
                debug!(pid = %self.id, tid = %thread, "event from unknown thread; adding record");
                self.add_thread(&mut inner, thread, Address::ZERO);
            }
            _ => {}
        }

        if event.exception_code() == Some(ExceptionCode::SINGLE_STEP) {
            if let Some(step) = inner.step_overs.remove(&thread) {
                if !self.finish_step_over(&mut inner, thread, step) {
                    return DispatchOutcome::Resumed;
                }
            }
        }

        inner.last_debug_event = Some(event.clone());

        if let DebugEvent::ProcessExited { exit_code, .. } = event {
            inner.threads.clear();
            inner.step_overs.clear();
            inner.trap_hits.clear();
            inner.halted_thread = None;
            inner.state = ProcessState::Dead;
            debug!(pid = %self.id, exit_code, "debuggee exited");
            return DispatchOutcome::Exited;
        }

        if let DebugEvent::Exception {
            code: ExceptionCode::BREAKPOINT,
            address,
            ..
        } = event
        {
            if inner.breakpoints.record_hit(*address) {
                debug!(pid = %self.id, tid = %thread, %address, "breakpoint hit");
                if !inner.compatibility_mode {
                    inner.trap_hits.insert(thread, *address);
                } else if let Err(e) = self.rewind_past_trap(&inner, thread, *address) {
                    warn!(pid = %self.id, tid = %thread, "failed to rewind instruction pointer: {e}");
                    inner.trap_hits.insert(thread, *address);
                }
            }
        }

        inner.halted_thread = Some(thread);
        inner.state = ProcessState::Halted;
        trace!(pid = %self.id, tid = %thread, "halted: {event}");
        DispatchOutcome::Halted
    }

    pub(crate) fn set_nexe_mem_base(&self, addr: Address)
    {
        let mut inner = self.lock();
        if !inner.nexe_mem_base.is_zero() && inner.nexe_mem_base != addr {
            warn!(pid = %self.id, old = %inner.nexe_mem_base, new = %addr, "nexe memory base changed");
        }
        if !addr.is_zero() && addr.value() < self.sandbox_size {
            warn!(
                pid = %self.id,
                base = %addr,
                sandbox_size = self.sandbox_size,
                "nexe memory base below sandbox size; relative pointers above it are treated as flat"
            );
        }
        inner.nexe_mem_base = addr;
    }

    pub(crate) fn set_nexe_entry_point(&self, addr: Address)
    {
        self.lock().nexe_entry_point = addr;
    }
}

impl Debuggee for DebuggeeProcess
{
    fn id(&self) -> ProcessId
    {
        self.id
    }

    fn state(&self) -> ProcessState
    {
        self.lock().state
    }

    fn enable_compatibility_mode(&self)
    {
        self.lock().compatibility_mode = true;
    }

    fn compatibility_mode(&self) -> bool
    {
        self.lock().compatibility_mode
    }

    fn last_debug_event(&self) -> Option<DebugEvent>
    {
        self.lock().last_debug_event.clone()
    }

    fn nexe_mem_base(&self) -> Address
    {
        self.lock().nexe_mem_base
    }

    fn nexe_entry_point(&self) -> Address
    {
        self.lock().nexe_entry_point
    }

    fn word_size_bits(&self) -> u32
    {
        self.word_size_bits
    }

    fn is_wow(&self) -> bool
    {
        self.is_wow
    }

    fn continue_execution(&self) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        self.require_event_loop_thread("continue")?;
        self.resume_halted(&mut inner, ResumeAction::Continue)
    }

    fn continue_and_pass_exception(&self) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        self.require_event_loop_thread("continue_and_pass_exception")?;
        let action = match inner.last_debug_event.as_ref().and_then(DebugEvent::exception_code) {
            Some(code) => ResumeAction::PassException { code },
            None => ResumeAction::Continue,
        };
        self.resume_halted(&mut inner, action)
    }

    fn single_step(&self) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        self.require_event_loop_thread("single_step")?;
        self.resume_halted(&mut inner, ResumeAction::SingleStep)
    }

    fn break_execution(&self) -> Result<()>
    {
        let inner = self.lock();
        self.require_alive(&inner)?;
        if inner.state == ProcessState::Halted {
            return Err(DebuggerError::AlreadyHalted);
        }
        self.api.break_process(self.id)?;
        debug!(pid = %self.id, "break requested");
        Ok(())
    }

    fn kill(&self) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_alive(&inner)?;
        self.api.terminate(self.id, KILL_EXIT_CODE)?;
        debug!(pid = %self.id, "terminate requested");

        // The exit event is only delivered once the halted thread is released.
        if inner.state == ProcessState::Halted && self.require_event_loop_thread("kill").is_ok() {
            if let Some(thread) = inner.halted_thread {
                self.api.resume(self.id, thread, ResumeAction::Continue)?;
                inner.state = ProcessState::Running;
                inner.halted_thread = None;
            }
        }
        Ok(())
    }

    fn detach(&self) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_alive(&inner)?;

        let stepping: Vec<Address> = inner.step_overs.values().map(|step| step.address).collect();
        let mut restored = Vec::new();
        for breakpoint in inner.breakpoints.list() {
            if stepping.contains(&breakpoint.address()) {
                continue;
            }
            match self.write_code(breakpoint.address(), breakpoint.original_bytes()) {
                Ok(()) => restored.push(breakpoint.address()),
                Err(e) => {
                    warn!(pid = %self.id, address = %breakpoint.address(), "failed to restore breakpoint on detach: {e}");
                }
            }
        }
        for (&thread, &address) in &inner.trap_hits {
            if let Err(e) = self.rewind_past_trap(&inner, thread, address) {
                warn!(pid = %self.id, tid = %thread, "failed to rewind instruction pointer on detach: {e}");
            }
        }

        if let Err(e) = self.api.detach(self.id) {
            // Still attached: put the traps back so the table matches memory.
            let trap = inner.breakpoints.trap().to_vec();
            for address in restored {
                if let Err(rearm) = self.write_code(address, &trap) {
                    warn!(pid = %self.id, %address, "failed to re-arm breakpoint: {rearm}");
                }
            }
            return Err(e);
        }

        inner.breakpoints.clear();
        inner.step_overs.clear();
        inner.trap_hits.clear();
        inner.threads.clear();
        inner.halted_thread = None;
        inner.state = ProcessState::Dead;
        debug!(pid = %self.id, "detached");
        Ok(())
    }

    fn get_thread(&self, id: ThreadId) -> Option<DebuggeeThread>
    {
        self.lock().threads.get(&id).cloned()
    }

    fn get_halted_thread(&self) -> Option<DebuggeeThread>
    {
        let inner = self.lock();
        if inner.state != ProcessState::Halted {
            return None;
        }
        inner.halted_thread.and_then(|id| inner.threads.get(&id).cloned())
    }

    fn get_thread_ids(&self) -> Vec<ThreadId>
    {
        self.lock().threads.keys().copied().collect()
    }

    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<()>
    {
        let inner = self.lock();
        self.require_alive(&inner)?;
        self.read_masked(&inner, addr, buf)
    }

    fn read_memory_raw(&self, addr: Address, buf: &mut [u8]) -> Result<()>
    {
        let inner = self.lock();
        self.require_alive(&inner)?;
        Self::check_range(addr, buf.len())?;
        self.api.read_memory(self.id, addr, buf)
    }

    fn write_memory(&self, addr: Address, data: &[u8]) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        Self::check_range(addr, data.len())?;

        let image = inner.breakpoints.patched_image(addr, data);
        self.api.write_memory(self.id, addr, &image)?;
        self.api.flush_instruction_cache(self.id, addr, image.len())?;
        inner.breakpoints.absorb_write(addr, data);
        Ok(())
    }

    fn read_debug_string(&self) -> Result<String>
    {
        let inner = self.lock();
        self.require_halted(&inner)?;
        let Some(&DebugEvent::OutputString { address, length, .. }) = inner.last_debug_event.as_ref() else {
            return Err(DebuggerError::NoDebugString);
        };
        if length > MAX_DEBUG_STRING_LEN {
            return Err(DebuggerError::InvalidArgument(format!(
                "debug string of {length} bytes exceeds {MAX_DEBUG_STRING_LEN}"
            )));
        }

        let mut bytes = vec![0; length];
        self.read_masked(&inner, address, &mut bytes)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn set_breakpoint(&self, addr: Address) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        if inner.breakpoints.contains(addr) {
            return Err(DebuggerError::BreakpointExists(addr));
        }

        let trap = inner.breakpoints.trap().to_vec();
        let mut original = vec![0; trap.len()];
        self.read_masked(&inner, addr, &mut original)?;
        self.write_code(addr, &trap)?;
        inner.breakpoints.insert(Breakpoint::new(addr, &original))?;
        debug!(pid = %self.id, address = %addr, "breakpoint set");
        Ok(())
    }

    fn remove_breakpoint(&self, addr: Address) -> Result<()>
    {
        let mut inner = self.lock();
        self.require_halted(&inner)?;
        let original = inner
            .breakpoints
            .get(addr)
            .map(|bp| bp.original_bytes().to_vec())
            .ok_or(DebuggerError::NoBreakpoint(addr))?;

        self.write_code(addr, &original)?;
        inner.breakpoints.remove(addr);
        debug!(pid = %self.id, address = %addr, "breakpoint removed");
        Ok(())
    }

    fn get_breakpoint(&self, addr: Address) -> Option<Breakpoint>
    {
        self.lock().breakpoints.get(addr).cloned()
    }

    fn get_breakpoints(&self) -> Vec<Breakpoint>
    {
        self.lock().breakpoints.list()
    }

    fn nexe_to_flat_address(&self, ptr: Address) -> Address
    {
        let inner = self.lock();
        let base = inner.nexe_mem_base;
        if base.is_zero() || self.is_in_sandbox(&inner, ptr) || ptr.value() >= self.sandbox_size {
            return ptr;
        }
        base.checked_add(ptr.value()).unwrap_or(ptr)
    }

    fn debug_api(&self) -> &Arc<dyn DebugApi>
    {
        &self.api
    }
}

impl Drop for DebuggeeProcess
{
    fn drop(&mut self)
    {
        let state = self.inner.get_mut().map_or(ProcessState::Dead, |inner| inner.state);
        if state != ProcessState::Dead {
            warn!(pid = %self.id, %state, "debuggee process dropped before its exit event");
        }
    }
}
