use crate::compiler::CompileError;

/// Errors surfaced by the library entry points.
///
/// Ruby-level control transfer never shows up here; it travels as
/// [`crate::runtime::Unwind`] until it either gets handled or reaches the top
/// of the main thread, where it becomes [`Error::Uncaught`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("{message} ({class})")]
    Uncaught {
        class: String,
        message: String,
        backtrace: Vec<String>,
    },
    #[error("invalid AST: {0}")]
    Ast(#[from] serde_json::Error),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("interpreter thread panicked")]
    ThreadPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    /// Process exit status the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Compile(_) | Error::Uncaught { .. } | Error::ThreadPanicked => 1,
            Error::Ast(_) | Error::Io { .. } | Error::Config(_) => 2,
        }
    }
}
