//! # Linux ptrace backend
//!
//! [`PtraceDebugApi`] implements [`DebugApi`] with `ptrace(2)`,
//! `/proc/<pid>/mem` and `kill(2)`; [`PtraceEventSource`] turns `waitpid`
//! results into [`DebugEvent`]s.
//!
//! ## Mapping onto debug events
//!
//! | wait result                              | event                         |
//! |------------------------------------------|-------------------------------|
//! | initial attach stop                      | process created               |
//! | first stop of a cloned thread            | thread created                |
//! | `SIGTRAP` from `int3` (`SI_KERNEL`)      | breakpoint, address = IP - 1  |
//! | `SIGTRAP` after `PTRACE_SINGLESTEP`      | single step                   |
//! | `SIGSTOP` after `break_process`          | breakpoint at the current IP  |
//! | any other stop signal                    | exception with a signal code  |
//! | exit / kill of the thread-group leader   | process exited                |
//! | exit / kill of another thread            | thread exited                 |
//!
//! Like the Windows debug loop, the instruction pointer reported after a
//! breakpoint trap points past the trap; compatibility mode rewinds it.
//!
//! ## Threading
//!
//! The kernel ties a tracee to the thread that attached it. Attach, resume,
//! register access and detach must run on the event-loop thread; only
//! `break_process`, `terminate` and memory access may come from elsewhere.
//! `detach` from another thread fails with `WrongThread`.
//!
//! Unlike Windows, threads that did not report the event keep running while
//! the process is halted. `detach` stops them with a group `SIGSTOP` first,
//! since ptrace only lets go of a stopped tracee, and sends `SIGCONT` after.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::api::{DebugApi, ResumeAction, ThreadContext};
use crate::engine::DebugEventSource;
use crate::error::{DebuggerError, Result};
use crate::events::{DebugEvent, ExceptionCode};
use crate::types::{Address, ProcessId, ThreadId};

/// `si_code` of a trap raised by the kernel itself (`int3` on x86).
const SI_KERNEL: libc::c_int = 0x80;
/// `si_code` of a hardware breakpoint trap.
const TRAP_BRKPT: libc::c_int = 1;
/// `si_code` of a trace (single-step) trap.
const TRAP_TRACE: libc::c_int = 2;

/// Width of the x86 `int3` trap.
const INT3_LEN: u64 = 1;

/// Sleep between `waitpid` polls while waiting for an event.
const WAIT_POLL_SLICE: Duration = Duration::from_millis(5);

fn pid_of(id: ProcessId) -> Pid
{
    Pid::from_raw(id.raw() as libc::pid_t)
}

fn tid_of(id: ThreadId) -> Pid
{
    Pid::from_raw(id.raw() as libc::pid_t)
}

fn thread_id(tid: Pid) -> ThreadId
{
    ThreadId(u64::from(tid.as_raw().unsigned_abs()))
}

fn process_id(pid: Pid) -> ProcessId
{
    ProcessId(pid.as_raw().unsigned_abs())
}

fn signal_of(code: ExceptionCode) -> Option<Signal>
{
    code.signal().and_then(|signo| Signal::try_from(signo).ok())
}

/// Linux implementation of [`DebugApi`]
#[derive(Debug)]
pub struct PtraceDebugApi
{
    /// Thread that creates the API and attaches; the kernel's tracer.
    tracer: thread::ThreadId,
    /// Processes with a `SIGSTOP` sent by `break_process` not yet reported.
    pending_breaks: Mutex<HashSet<ProcessId>>,
}

impl Default for PtraceDebugApi
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl PtraceDebugApi
{
    /// The calling thread becomes the tracer.
    pub fn new() -> Self
    {
        Self {
            tracer: thread::current().id(),
            pending_breaks: Mutex::new(HashSet::new()),
        }
    }

    fn pending_breaks(&self) -> MutexGuard<'_, HashSet<ProcessId>>
    {
        self.pending_breaks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending_break(&self, pid: ProcessId) -> bool
    {
        self.pending_breaks().remove(&pid)
    }

    fn mem_path(pid: ProcessId) -> String
    {
        format!("/proc/{pid}/mem")
    }
}

impl DebugApi for PtraceDebugApi
{
    fn read_memory(&self, pid: ProcessId, addr: Address, buf: &mut [u8]) -> Result<()>
    {
        let file = File::open(Self::mem_path(pid))?;
        file.read_exact_at(buf, addr.value())
            .map_err(|e| DebuggerError::memory_access(addr, buf.len(), e.to_string()))
    }

    fn write_memory(&self, pid: ProcessId, addr: Address, data: &[u8]) -> Result<()>
    {
        let file = OpenOptions::new().read(true).write(true).open(Self::mem_path(pid))?;

        // Probe the whole range first so a partially mapped range fails untouched.
        let mut probe = vec![0; data.len()];
        file.read_exact_at(&mut probe, addr.value())
            .map_err(|e| DebuggerError::memory_access(addr, data.len(), e.to_string()))?;
        file.write_all_at(data, addr.value())
            .map_err(|e| DebuggerError::memory_access(addr, data.len(), e.to_string()))
    }

    fn get_thread_context(&self, _pid: ProcessId, thread: ThreadId) -> Result<ThreadContext>
    {
        let regs = ptrace::getregs(tid_of(thread))?;
        Ok(ThreadContext {
            instruction_pointer: Address::new(regs.rip),
            stack_pointer: Address::new(regs.rsp),
            flags: regs.eflags,
        })
    }

    fn set_thread_context(&self, _pid: ProcessId, thread: ThreadId, context: &ThreadContext) -> Result<()>
    {
        let tid = tid_of(thread);
        let mut regs = ptrace::getregs(tid)?;
        regs.rip = context.instruction_pointer.value();
        regs.rsp = context.stack_pointer.value();
        regs.eflags = context.flags;
        ptrace::setregs(tid, regs)?;
        Ok(())
    }

    fn resume(&self, _pid: ProcessId, thread: ThreadId, action: ResumeAction) -> Result<()>
    {
        let tid = tid_of(thread);
        let result = match action {
            ResumeAction::Continue => ptrace::cont(tid, None),
            ResumeAction::PassException { code } => ptrace::cont(tid, signal_of(code)),
            ResumeAction::SingleStep => ptrace::step(tid, None),
        };
        match result {
            // The thread died while stopped; its exit is reported by waitpid.
            Err(Errno::ESRCH) => {
                debug!(tid = %thread, "resume of vanished thread ignored");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn break_process(&self, pid: ProcessId) -> Result<()>
    {
        self.pending_breaks().insert(pid);
        if let Err(e) = kill(pid_of(pid), Signal::SIGSTOP) {
            self.pending_breaks().remove(&pid);
            return Err(e.into());
        }
        Ok(())
    }

    fn terminate(&self, pid: ProcessId, _exit_code: u32) -> Result<()>
    {
        kill(pid_of(pid), Signal::SIGKILL)?;
        Ok(())
    }

    fn detach(&self, pid: ProcessId) -> Result<()>
    {
        if thread::current().id() != self.tracer {
            return Err(DebuggerError::WrongThread("detach"));
        }
        self.pending_breaks().remove(&pid);

        // ESRCH means "not in a ptrace stop" as long as the task still exists.
        let mut running = Vec::new();
        let mut first_error = None;
        for tid in task_ids(pid)? {
            match ptrace::detach(tid, None) {
                Ok(()) => {}
                Err(Errno::ESRCH) if task_exists(pid, tid) => running.push(tid),
                Err(Errno::ESRCH) => trace!(%pid, tid = tid.as_raw(), "task gone before detach"),
                Err(e) => {
                    warn!(%pid, tid = tid.as_raw(), "detach failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !running.is_empty() {
            debug!(%pid, count = running.len(), "stopping running tasks for detach");
            kill(pid_of(pid), Signal::SIGSTOP)?;
            for tid in running {
                let forward = match wait_for_stop(tid) {
                    Ok(TaskStop::Stopped { forward }) => forward,
                    Ok(TaskStop::Gone) => continue,
                    Err(e) => {
                        warn!(%pid, tid = tid.as_raw(), "waiting for stop failed: {e}");
                        first_error.get_or_insert(e);
                        continue;
                    }
                };
                match ptrace::detach(tid, forward) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => {
                        warn!(%pid, tid = tid.as_raw(), "detach failed: {e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
            kill(pid_of(pid), Signal::SIGCONT)?;
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}

/// How a task ended up after [`wait_for_stop`]
enum TaskStop
{
    /// Exited or reaped elsewhere; nothing left to detach.
    Gone,
    /// In a ptrace stop. `forward` is the signal to hand back on detach;
    /// `None` for the stop and trap signals the debugger caused.
    Stopped
    {
        forward: Option<Signal>
    },
}

/// Block until the traced `tid` stops or exits.
fn wait_for_stop(tid: Pid) -> nix::Result<TaskStop>
{
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, signal)) => {
                let forward = (signal != Signal::SIGSTOP && signal != Signal::SIGTRAP).then_some(signal);
                return Ok(TaskStop::Stopped { forward });
            }
            Ok(WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_)) => {
                return Ok(TaskStop::Stopped { forward: None });
            }
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => return Ok(TaskStop::Gone),
            Ok(WaitStatus::Continued(_) | WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Whether `tid` is still a task of `pid`.
fn task_exists(pid: ProcessId, tid: Pid) -> bool
{
    Path::new(&format!("/proc/{pid}/task/{}", tid.as_raw())).exists()
}

/// Thread ids of `pid` from `/proc/<pid>/task`.
fn task_ids(pid: ProcessId) -> Result<Vec<Pid>>
{
    let mut tids = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort_unstable_by_key(|tid| tid.as_raw());
    Ok(tids)
}

/// Thread-group id of `tid` from `/proc/<tid>/status`.
fn thread_group_of(tid: Pid) -> Option<ProcessId>
{
    let status = fs::read_to_string(format!("/proc/{}/status", tid.as_raw())).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|value| value.trim().parse::<u32>().ok())
        .map(ProcessId)
}

/// Load address of the main executable, from `/proc/<pid>/maps`.
fn image_base(pid: ProcessId) -> Address
{
    let Ok(exe) = fs::read_link(format!("/proc/{pid}/exe")) else {
        return Address::ZERO;
    };
    let Ok(maps) = fs::read_to_string(format!("/proc/{pid}/maps")) else {
        return Address::ZERO;
    };
    let exe = exe.to_string_lossy();
    maps.lines()
        .find(|line| line.ends_with(exe.as_ref()))
        .and_then(|line| line.split('-').next())
        .and_then(|start| u64::from_str_radix(start, 16).ok())
        .map_or(Address::ZERO, Address::new)
}

/// Linux implementation of [`DebugEventSource`]
///
/// Created by [`PtraceEventSource::attach`], which stops the target and
/// queues its process-created and thread-created events.
#[derive(Debug)]
pub struct PtraceEventSource
{
    api: Arc<PtraceDebugApi>,
    /// Owning process of every traced thread.
    threads: HashMap<Pid, ProcessId>,
    /// Threads announced by a clone event that have not stopped yet.
    pending_clones: HashSet<Pid>,
    queued: VecDeque<DebugEvent>,
}

impl PtraceEventSource
{
    /// Attach to every thread of `pid`.
    ///
    /// Must run on the thread that will drive the event loop.
    ///
    /// ## Errors
    ///
    /// Returns an error if the main thread cannot be attached (permissions,
    /// `ptrace_scope`, no such process).
    pub fn attach(api: Arc<PtraceDebugApi>, pid: ProcessId) -> Result<Self>
    {
        let leader = pid_of(pid);
        ptrace::attach(leader)?;
        waitpid(leader, Some(WaitPidFlag::__WALL))?;
        ptrace::setoptions(leader, Options::PTRACE_O_TRACECLONE)?;
        debug!(%pid, "attached");

        let mut source = Self {
            api,
            threads: HashMap::from([(leader, pid)]),
            pending_clones: HashSet::new(),
            queued: VecDeque::new(),
        };
        let start_address = ptrace::getregs(leader).map_or(Address::ZERO, |regs| Address::new(regs.rip));
        source.queued.push_back(DebugEvent::ProcessCreated {
            pid,
            thread: thread_id(leader),
            image_base: image_base(pid),
            start_address,
        });

        for tid in task_ids(pid)?.into_iter().filter(|tid| *tid != leader) {
            if let Err(e) = source.attach_thread(pid, tid) {
                warn!(%pid, tid = tid.as_raw(), "failed to attach thread: {e}");
            }
        }
        Ok(source)
    }

    fn attach_thread(&mut self, pid: ProcessId, tid: Pid) -> Result<()>
    {
        ptrace::attach(tid)?;
        waitpid(tid, Some(WaitPidFlag::__WALL))?;
        ptrace::setoptions(tid, Options::PTRACE_O_TRACECLONE)?;
        self.threads.insert(tid, pid);
        self.queued.push_back(DebugEvent::ThreadCreated {
            pid,
            thread: thread_id(tid),
            start_address: Address::ZERO,
        });
        Ok(())
    }

    fn owner_of(&self, tid: Pid) -> Option<ProcessId>
    {
        self.threads.get(&tid).copied().or_else(|| thread_group_of(tid))
    }

    fn exit_event(&mut self, tid: Pid, exit_code: u32) -> Option<DebugEvent>
    {
        let pid = self.threads.remove(&tid).or_else(|| thread_group_of(tid))?;
        let thread = thread_id(tid);
        if process_id(tid) == pid {
            self.threads.retain(|_, owner| *owner != pid);
            Some(DebugEvent::ProcessExited { pid, thread, exit_code })
        } else {
            Some(DebugEvent::ThreadExited { pid, thread, exit_code })
        }
    }

    fn exception(pid: ProcessId, tid: Pid, code: ExceptionCode, address: Address) -> DebugEvent
    {
        DebugEvent::Exception {
            pid,
            thread: thread_id(tid),
            code,
            address,
            first_chance: true,
        }
    }

    fn current_ip(tid: Pid) -> Address
    {
        ptrace::getregs(tid).map_or(Address::ZERO, |regs| Address::new(regs.rip))
    }

    fn stop_event(&mut self, tid: Pid, signal: Signal) -> Option<DebugEvent>
    {
        let Some(pid) = self.owner_of(tid) else {
            warn!(tid = tid.as_raw(), "stop of untraced thread ignored");
            return None;
        };

        if signal == Signal::SIGSTOP && (self.pending_clones.remove(&tid) || !self.threads.contains_key(&tid)) {
            self.threads.insert(tid, pid);
            return Some(DebugEvent::ThreadCreated {
                pid,
                thread: thread_id(tid),
                start_address: Self::current_ip(tid),
            });
        }
        if signal == Signal::SIGSTOP && self.api.take_pending_break(pid) {
            return Some(Self::exception(pid, tid, ExceptionCode::BREAKPOINT, Self::current_ip(tid)));
        }
        if signal != Signal::SIGTRAP {
            return Some(Self::exception(
                pid,
                tid,
                ExceptionCode::from_signal(signal as i32),
                Self::current_ip(tid),
            ));
        }

        let si_code = ptrace::getsiginfo(tid).map_or(0, |info| info.si_code);
        let ip = Self::current_ip(tid);
        let event = match si_code {
            SI_KERNEL | TRAP_BRKPT => Self::exception(pid, tid, ExceptionCode::BREAKPOINT, ip - INT3_LEN),
            TRAP_TRACE => Self::exception(pid, tid, ExceptionCode::SINGLE_STEP, ip),
            _ => Self::exception(pid, tid, ExceptionCode::from_signal(signal as i32), ip),
        };
        Some(event)
    }

    /// Translate one wait status; `None` for stops handled internally.
    fn translate(&mut self, status: WaitStatus) -> Option<DebugEvent>
    {
        match status {
            WaitStatus::Exited(tid, code) => self.exit_event(tid, code as u32),
            WaitStatus::Signaled(tid, signal, _) => self.exit_event(tid, 128 + signal as u32),
            WaitStatus::Stopped(tid, signal) => self.stop_event(tid, signal),
            WaitStatus::PtraceEvent(tid, _, event) if event == ptrace::Event::PTRACE_EVENT_CLONE as libc::c_int => {
                match ptrace::getevent(tid) {
                    Ok(new_tid) => {
                        let new_tid = Pid::from_raw(new_tid as libc::pid_t);
                        trace!(tid = tid.as_raw(), new_tid = new_tid.as_raw(), "clone");
                        if let Some(pid) = self.owner_of(tid) {
                            self.threads.insert(new_tid, pid);
                            self.pending_clones.insert(new_tid);
                        }
                    }
                    Err(e) => warn!(tid = tid.as_raw(), "failed to read clone event: {e}"),
                }
                if let Err(e) = ptrace::cont(tid, None) {
                    warn!(tid = tid.as_raw(), "failed to continue after clone: {e}");
                }
                None
            }
            WaitStatus::PtraceEvent(tid, _, _) | WaitStatus::PtraceSyscall(tid) => {
                if let Err(e) = ptrace::cont(tid, None) {
                    warn!(tid = tid.as_raw(), "failed to continue after ptrace stop: {e}");
                }
                None
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
        }
    }
}

impl DebugEventSource for PtraceEventSource
{
    fn wait_for_debug_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>
    {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => {}
                Ok(status) => {
                    if let Some(event) = self.translate(status) {
                        return Ok(Some(event));
                    }
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL_SLICE.min(deadline - now));
        }
    }
}
