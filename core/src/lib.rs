//! Command invocation and output-streaming correlation core.
//!
//! [`InvocationManager`] dispatches external command-line processes, captures
//! their output incrementally and delivers it to observers under a strict
//! correlation guarantee: only chunks belonging to the currently active
//! invocation are surfaced, even when invocations overlap, are abandoned, or
//! race with a newly dispatched one. A superseded invocation keeps running in
//! the background, but its output is never visible again and it produces no
//! result.

mod correlation;
mod error;
mod invocation;
mod manager;
mod spawn;

pub use correlation::InvocationSnapshot;
pub use error::RelayErr;
pub use error::Result;
pub use invocation::DispatchParams;
pub use manager::InvocationManager;
