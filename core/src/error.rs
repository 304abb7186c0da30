use cmdrelay_protocol::InvocationId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayErr>;

#[derive(Debug, Error)]
pub enum RelayErr {
    #[error("command line is empty")]
    EmptyCommandLine,

    #[error("could not parse command line `{command_line}`")]
    ParseCommandLine { command_line: String },

    /// The external process could not be started. No output chunk is ever
    /// produced for the invocation and it never reaches Running.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Invocation ids are unique per process lifetime; reuse is a programming
    /// error on the caller's side, not a runtime fault of the core.
    #[error("invocation id `{0}` was already dispatched")]
    DuplicateInvocationId(InvocationId),

    #[error("correlation task is not running")]
    CorrelatorClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
