//! # Types
//!
//! Platform-agnostic types shared by the process-control core.
//!
//! These types keep raw integers out of the control surface: addresses,
//! process and thread identifiers, and the debuggee run state each get their
//! own type so they cannot be mixed up at call sites.

pub mod address;
pub mod process;

pub use address::Address;
pub use process::{Architecture, ProcessId, ProcessState, ThreadId};
