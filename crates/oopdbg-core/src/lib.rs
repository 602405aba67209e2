//! # oopdbg-core
//!
//! Process-control core of an out-of-process debugger.
//!
//! This crate models a debuggee process driven through the OS debug
//! primitives:
//! - Run state (`Running` / `Halted` / `Dead`) driven by debug events
//! - Continue, pass-exception, single-step, break, kill and detach
//! - Memory reads and writes with software breakpoints masked out
//! - Software breakpoints with automatic step-over
//! - Address translation for a sandboxed module loaded at a base address
//!
//! ## Layout
//!
//! - [`engine`]: the event loop and the process registry
//! - [`process`]: the [`Debuggee`] control surface and its implementation
//! - [`api`]: the [`DebugApi`] trait every OS binding implements
//! - [`platform`]: OS bindings (Linux `ptrace`)
//! - [`mock`]: an in-memory backend for tests
//!
//! ## Platform Support
//!
//! - **Linux (x86-64)**: `ptrace`, `waitpid`, `/proc/<pid>/mem`
//! - **Everything else**: the core builds and runs against [`mock`] only
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use oopdbg_core::config::EngineConfig;
//! use oopdbg_core::events::DebugEvent;
//! use oopdbg_core::mock::MockDebugApi;
//! use oopdbg_core::types::{Address, ProcessId, ThreadId};
//! use oopdbg_core::{Debuggee, ExecutionEngine};
//!
//! let api = Arc::new(MockDebugApi::new());
//! let mut engine = ExecutionEngine::new(api, EngineConfig::default());
//! engine.dispatch(&DebugEvent::ProcessCreated {
//!     pid: ProcessId(42),
//!     thread: ThreadId(1),
//!     image_base: Address::new(0x40_0000),
//!     start_address: Address::new(0x40_1000),
//! })?;
//!
//! let process = engine.process(ProcessId(42)).expect("registered");
//! assert!(process.is_halted());
//! # Ok::<(), oopdbg_core::DebuggerError>(())
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod breakpoints;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod mock;
pub mod platform;
pub mod process;
pub mod thread;
pub mod types;

pub use api::{DebugApi, ResumeAction, ThreadContext};
pub use breakpoints::Breakpoint;
pub use config::{EngineConfig, ProcessConfig};
pub use engine::{notification_channel, DebugEventSource, ExecutionEngine, ProcessNotification};
// Re-export commonly used types
pub use error::{DebuggerError, Result};
pub use events::{DebugEvent, ExceptionCode};
pub use process::{Debuggee, DebuggeeProcess, DispatchOutcome};
pub use thread::DebuggeeThread;
pub use types::{Address, Architecture, ProcessId, ProcessState, ThreadId};
