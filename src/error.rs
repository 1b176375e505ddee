use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CarapaceError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("VM failed to boot: {message}")]
    #[diagnostic(help(
        "check that the base image is a bootable qcow2 and that the hypervisor binary is installed"
    ))]
    BootFailure {
        message: String,
        /// Tail of the guest serial log, when one was captured.
        serial_tail: Option<String>,
    },

    #[error("ssh transport failed: {context}")]
    #[diagnostic(help("ensure the openssh client is installed and the VM is still running"))]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("no warm VM became available within {waited_ms}ms")]
    #[diagnostic(help("raise the pool target size or the acquire timeout"))]
    PoolExhausted { waited_ms: u64 },

    #[error("pool is stopped")]
    PoolStopped,

    #[error("unknown VM '{id}'")]
    NotFound { id: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CarapaceError {
    /// Shorthand for the pervasive I/O-with-context pattern.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CarapaceError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the kinds a caller may reasonably retry against a fresh VM.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CarapaceError::BootFailure { .. }
                | CarapaceError::Transport { .. }
                | CarapaceError::PoolExhausted { .. }
        )
    }
}
