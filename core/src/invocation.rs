use std::collections::HashMap;
use std::path::PathBuf;

use cmdrelay_protocol::InvocationId;

use crate::error::RelayErr;
use crate::error::Result;

/// One request to run an external command.
#[derive(Debug, Clone, Default)]
pub struct DispatchParams {
    /// Full shell-style argument string for the external program.
    pub command_line: String,
    /// Absent means the current working directory of this process.
    pub working_dir: Option<PathBuf>,
    /// Opaque context forwarded to the child's environment (e.g. a target or
    /// project selection); the core never inspects these values.
    pub env: HashMap<String, String>,
    /// Caller-supplied id; the dispatcher generates one when absent.
    pub invocation_id: Option<InvocationId>,
}

impl DispatchParams {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            ..Default::default()
        }
    }

    /// Drops a redundant leading `program` token, for callers that paste
    /// `program args...` into an input dedicated to `program`'s arguments.
    pub fn strip_program_prefix(mut self, program: &str) -> Self {
        let trimmed = self.command_line.trim_start();
        if let Some(first) = trimmed.split_whitespace().next()
            && first.eq_ignore_ascii_case(program)
        {
            self.command_line = trimmed[first.len()..].trim_start().to_string();
        }
        self
    }

    /// Tokenizes the command line, rejecting empty or unparseable input.
    pub(crate) fn parse_command(&self) -> Result<Vec<String>> {
        let trimmed = self.command_line.trim();
        if trimmed.is_empty() {
            return Err(RelayErr::EmptyCommandLine);
        }
        match shlex::split(trimmed) {
            Some(tokens) if !tokens.is_empty() => Ok(tokens),
            _ => Err(RelayErr::ParseCommandLine {
                command_line: trimmed.to_string(),
            }),
        }
    }
}
