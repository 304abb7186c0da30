//! Wire and data types shared between the invocation core and its observers.
//!
//! The types here mirror the external interface of the core: a caller
//! dispatches a command under an [`InvocationId`], the process layer tags each
//! output fragment with that id, and observers receive [`InvocationEvent`]s
//! carrying accepted fragments and, eventually, the terminal
//! [`InvocationResult`].

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies one logical request to run an external command.
///
/// Ids are opaque and unique per process lifetime; they are either supplied by
/// the caller or generated by the dispatcher, and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl InvocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One fragment of an invocation's output, as forwarded to observers.
///
/// Fragments arrive in write order per `(invocation_id, stream)` pair but are
/// not guaranteed to align to line boundaries, and no ordering is guaranteed
/// between the two streams of the same invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunkEvent {
    #[serde(rename = "command_id")]
    pub invocation_id: InvocationId,
    pub stream: OutputStream,
    pub chunk: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Created,
    Running,
    Completed,
    Failed,
    /// A later invocation became active while this one was still running. The
    /// underlying process keeps executing, but its output is never surfaced
    /// again and it produces no result.
    Superseded,
}

/// Terminal outcome of an invocation that ran to completion.
///
/// `stdout` and `stderr` are the exact ordered concatenation of every chunk
/// accepted for the invocation. A non-zero `exit_code` is not an error;
/// callers inspect it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Events surfaced to observers while an invocation makes progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationEvent {
    /// An output fragment accepted for the currently active invocation.
    OutputDelta(OutputChunkEvent),
    /// The active invocation exited; emitted exactly once per completed
    /// invocation.
    Completed {
        invocation_id: InvocationId,
        result: InvocationResult,
    },
}
