//! tarn: a Debug Adapter Protocol bridge for an embedded Lua VM.
//!
//! The host process links this crate, registers its script threads, and
//! forwards VM trace events into [`DebugAdapter::trace_event`]. A debugger
//! UI connects over TCP (or a unix socket) with standard DAP framing to set
//! breakpoints, step, inspect frames and variables, and observe uncaught
//! errors — while the host keeps servicing its own event loop.
//!
//! The synchronization model is deliberately stop-the-world: one re-entrant
//! session mutex guards all adapter state. A stopped script thread holds it
//! through the whole stopped loop, the internal worker thread only ever
//! `try_lock`s, and other script threads freeze at their next hook entry.

pub mod breakpoints;
pub mod config;
pub mod dap;
pub mod error;
mod requests;
pub mod session;
pub mod source;
pub mod state;
pub mod threads;
pub mod transport;

pub use crate::error::{AdapterError, AdapterResult};
pub use crate::session::{ConsoleHandle, DebugAdapter, ExceptionKind, OutputRedirector};
pub use crate::source::{IdentityMapper, MapOutcome, PathMapper};
pub use crate::state::SessionState;
