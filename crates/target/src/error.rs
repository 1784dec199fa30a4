use thiserror::Error;

/// Failure of a primitive process-control operation.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),

    #[error("ptrace {request} failed: {source}")]
    Ptrace {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("waitpid failed: {0}")]
    Wait(#[source] std::io::Error),

    #[error("cannot access child memory at {addr:#x}")]
    Memory { addr: u64 },

    #[error("no traced process")]
    NotRunning,

    #[error("unknown breakpoint at {0:#x}")]
    UnknownBreakpoint(u64),

    #[error("scripted process: {0}")]
    Script(String),
}
