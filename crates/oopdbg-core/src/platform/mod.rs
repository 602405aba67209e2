//! # Platform-Specific Implementations
//!
//! OS bindings for [`DebugApi`] and [`DebugEventSource`]:
//!
//! - **Linux (x86-64)**: `ptrace`, `waitpid` and `/proc/<pid>/mem`
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - **Windows**: the Windows Debug API is the model the core follows; no
//!   binding yet
//!
//! Everything else in the crate is OS-agnostic and only talks to these traits.

use std::sync::Arc;

use crate::api::DebugApi;
use crate::engine::DebugEventSource;
use crate::error::Result;
use crate::types::ProcessId;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

/// A debug API and event source bound to one freshly attached process
pub struct Attached
{
    pub api: Arc<dyn DebugApi>,
    pub events: Box<dyn DebugEventSource>,
}

/// Attach to `pid` with the native backend of this platform.
///
/// The calling thread becomes the thread that must drive the event loop.
///
/// ## Example
///
/// ```rust,no_run
/// use oopdbg_core::config::EngineConfig;
/// use oopdbg_core::engine::ExecutionEngine;
/// use oopdbg_core::platform::attach;
/// use oopdbg_core::types::ProcessId;
///
/// let mut attached = attach(ProcessId(12345))?;
/// let mut engine = ExecutionEngine::new(attached.api, EngineConfig::default());
/// engine.run_until_halt(attached.events.as_mut(), 10)?;
/// # Ok::<(), oopdbg_core::error::DebuggerError>(())
/// ```
///
/// ## Errors
///
/// - `UnsupportedPlatform` on hosts without a backend
/// - whatever the backend reports when attaching fails
pub fn attach(pid: ProcessId) -> Result<Attached>
{
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let api = Arc::new(linux::PtraceDebugApi::new());
        let events = linux::PtraceEventSource::attach(Arc::clone(&api), pid)?;
        Ok(Attached {
            api,
            events: Box::new(events),
        })
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        Err(crate::error::DebuggerError::UnsupportedPlatform(format!(
            "{} ({}), pid {pid}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    }
}
