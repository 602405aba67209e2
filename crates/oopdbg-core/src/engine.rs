//! # Execution engine
//!
//! The engine owns the debug event loop. It pulls events from a
//! [`DebugEventSource`], keeps the registry of live debuggee processes and
//! routes each event to the process it belongs to.
//!
//! ## Lifecycle
//!
//! 1. A process-created event registers a new [`DebuggeeProcess`]
//! 2. Every later event for that pid is dispatched to it and halts it
//! 3. The process-exit event is dispatched (the process becomes `Dead`) and
//!    only then is the process removed from the registry
//!
//! The thread that calls [`ExecutionEngine::dispatch`] is the event-loop
//! thread of every process it creates.
//!
//! ## Notifications
//!
//! Higher layers can observe run-state changes without polling by handing
//! the engine the sender half of a [`notification_channel`].

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::api::DebugApi;
use crate::config::EngineConfig;
use crate::error::{DebuggerError, Result};
use crate::events::DebugEvent;
use crate::process::{Debuggee, DebuggeeProcess, DispatchOutcome};
use crate::types::{Address, ProcessId, ThreadId};

/// Producer of OS debug events
///
/// The OS-level "wait for debug event" primitive. Implemented by the
/// platform backends and by [`ScriptedEventSource`](crate::mock::ScriptedEventSource).
pub trait DebugEventSource
{
    /// Block for at most `timeout` waiting for the next debug event.
    ///
    /// Returns `Ok(None)` when the wait timed out.
    fn wait_for_debug_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>;
}

/// Run-state change published by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessNotification
{
    /// A process halted and is waiting for a command.
    Halted
    {
        pid: ProcessId,
        thread: ThreadId,
        event: DebugEvent,
    },
    /// An internal step-over completed and the process kept running.
    Resumed
    {
        pid: ProcessId,
    },
    /// A process exited and was removed from the registry.
    Exited
    {
        pid: ProcessId,
        exit_code: u32,
    },
}

impl ProcessNotification
{
    /// Human-readable description of the notification.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Halted { pid, event, .. } => format!("Process {pid} halted: {}", event.describe()),
            Self::Resumed { pid } => format!("Process {pid} resumed"),
            Self::Exited { pid, exit_code } => format!("Process {pid} exited with code {exit_code}"),
        }
    }
}

/// Sender side of the notification channel.
pub type NotificationSender = mpsc::Sender<ProcessNotification>;
/// Receiver side of the notification channel.
pub type NotificationReceiver = mpsc::Receiver<ProcessNotification>;

/// Create a new notification channel.
#[must_use]
pub fn notification_channel() -> (NotificationSender, NotificationReceiver)
{
    mpsc::channel()
}

/// Registry of debuggee processes plus the dispatch loop
#[derive(Debug)]
pub struct ExecutionEngine
{
    api: Arc<dyn DebugApi>,
    config: EngineConfig,
    processes: BTreeMap<ProcessId, Arc<DebuggeeProcess>>,
    notifier: Option<NotificationSender>,
}

impl ExecutionEngine
{
    pub fn new(api: Arc<dyn DebugApi>, config: EngineConfig) -> Self
    {
        Self {
            api,
            config,
            processes: BTreeMap::new(),
            notifier: None,
        }
    }

    /// Publish run-state changes on `sender`.
    #[must_use]
    pub fn with_notifications(mut self, sender: NotificationSender) -> Self
    {
        self.notifier = Some(sender);
        self
    }

    pub fn config(&self) -> &EngineConfig
    {
        &self.config
    }

    /// Shared handle to a registered process.
    pub fn process(&self, pid: ProcessId) -> Option<Arc<DebuggeeProcess>>
    {
        self.processes.get(&pid).cloned()
    }

    /// Pids of all registered processes, ascending.
    pub fn process_ids(&self) -> Vec<ProcessId>
    {
        self.processes.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool
    {
        self.processes.is_empty()
    }

    /// Record where the loader placed the sandboxed module of `pid`.
    ///
    /// ## Errors
    ///
    /// `ProcessNotFound` if `pid` is not registered.
    pub fn set_nexe_layout(&self, pid: ProcessId, mem_base: Address, entry_point: Address) -> Result<()>
    {
        let process = self
            .processes
            .get(&pid)
            .ok_or(DebuggerError::ProcessNotFound(pid.raw()))?;
        process.set_nexe_mem_base(mem_base);
        process.set_nexe_entry_point(entry_point);
        debug!(%pid, %mem_base, %entry_point, "nexe layout recorded");
        Ok(())
    }

    /// Route one debug event to its process.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the event belongs to an unregistered pid
    /// - whatever [`DebuggeeProcess::new`] reports for a process-created event
    pub fn dispatch(&mut self, event: &DebugEvent) -> Result<DispatchOutcome>
    {
        let pid = event.pid();
        trace!(%pid, "dispatching {event}");

        let process = match (event, self.processes.get(&pid)) {
            (_, Some(process)) => {
                if matches!(event, DebugEvent::ProcessCreated { .. }) {
                    warn!(%pid, "process created twice; reusing existing record");
                }
                Arc::clone(process)
            }
            (DebugEvent::ProcessCreated { .. }, None) => {
                let process = Arc::new(DebuggeeProcess::new(pid, Arc::clone(&self.api), &self.config.process)?);
                info!(%pid, "debuggee registered");
                self.processes.insert(pid, Arc::clone(&process));
                process
            }
            (_, None) => {
                warn!(%pid, "event for unknown process: {event}");
                return Err(DebuggerError::ProcessNotFound(pid.raw()));
            }
        };

        let outcome = process.on_debug_event(event);
        match outcome {
            DispatchOutcome::Halted => self.notify(ProcessNotification::Halted {
                pid,
                thread: event.thread(),
                event: event.clone(),
            }),
            DispatchOutcome::Resumed => self.notify(ProcessNotification::Resumed { pid }),
            DispatchOutcome::Exited | DispatchOutcome::Ignored => {}
        }

        if process.state().is_dead() && self.processes.remove(&pid).is_some() {
            let exit_code = match event {
                DebugEvent::ProcessExited { exit_code, .. } => *exit_code,
                _ => 0,
            };
            info!(%pid, exit_code, "debuggee removed");
            self.notify(ProcessNotification::Exited { pid, exit_code });
        }
        Ok(outcome)
    }

    /// Wait one poll interval for an event and dispatch it.
    ///
    /// Returns the dispatched event and its outcome, or `None` on timeout.
    pub fn wait_and_dispatch<S>(&mut self, source: &mut S) -> Result<Option<(DebugEvent, DispatchOutcome)>>
    where
        S: DebugEventSource + ?Sized,
    {
        let Some(event) = source.wait_for_debug_event(self.config.poll_interval)? else {
            return Ok(None);
        };
        let outcome = self.dispatch(&event)?;
        Ok(Some((event, outcome)))
    }

    /// Dispatch events until one halts or ends a process.
    ///
    /// Gives up after `max_waits` waits, timed-out ones included.
    pub fn run_until_halt<S>(&mut self, source: &mut S, max_waits: usize) -> Result<Option<(DebugEvent, DispatchOutcome)>>
    where
        S: DebugEventSource + ?Sized,
    {
        for _ in 0..max_waits {
            match self.wait_and_dispatch(source)? {
                Some((event, outcome @ (DispatchOutcome::Halted | DispatchOutcome::Exited))) => {
                    return Ok(Some((event, outcome)));
                }
                Some(_) | None => {}
            }
        }
        Ok(None)
    }

    /// Detach from every live process. Failures are logged and the first
    /// error is returned after all processes were tried; a process that could
    /// not be detached stays registered.
    pub fn detach_all(&mut self) -> Result<()>
    {
        let mut first_error = None;
        self.processes.retain(|pid, process| match process.detach() {
            Ok(()) | Err(DebuggerError::ProcessDead(_)) => false,
            Err(e) => {
                warn!(%pid, "detach failed: {e}");
                first_error.get_or_insert(e);
                true
            }
        });
        first_error.map_or(Ok(()), Err)
    }

    fn notify(&self, notification: ProcessNotification)
    {
        if let Some(sender) = &self.notifier {
            if sender.send(notification).is_err() {
                trace!("notification receiver dropped");
            }
        }
    }
}
