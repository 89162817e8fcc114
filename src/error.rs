use std::fmt;

/// Result type used by the link orchestration core.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a core error, independent of the wrapping context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    MalformedInput,
    KernelOperation,
    NamespaceSwitch,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::KernelOperation => "kernel operation failed",
            ErrorKind::NamespaceSwitch => "namespace switch failed",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// Errors raised while manipulating links, VLAN tables and namespaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A named link, VF table entry or bridge member does not exist.
    #[error("{what} {name} not found")]
    NotFound { what: &'static str, name: String },

    /// An input string (usually a MAC address) could not be parsed.
    #[error("malformed {what} {value:?}: {reason}")]
    Malformed {
        what: &'static str,
        value: String,
        reason: String,
    },

    /// The kernel (or the tool talking to it) rejected a mutation.
    #[error("{op} on {dev} failed: {reason}")]
    Kernel {
        op: &'static str,
        dev: String,
        reason: String,
    },

    /// The calling thread could not enter the requested namespace.
    #[error("cannot switch to network namespace {path}: {reason}")]
    NamespaceSwitch { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An inner error annotated with the operation that was running.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn malformed(what: &'static str, value: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::Malformed {
            what,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kernel(op: &'static str, dev: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::Kernel {
            op,
            dev: dev.into(),
            reason: reason.to_string(),
        }
    }

    /// Kind of the innermost error, looking through any context layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Malformed { .. } => ErrorKind::MalformedInput,
            Error::Kernel { .. } => ErrorKind::KernelOperation,
            Error::NamespaceSwitch { .. } => ErrorKind::NamespaceSwitch,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { source, .. } => source.kind(),
        }
    }
}

/// Adds operation context to core results, similar to `anyhow::Context`.
pub trait ResultExt<T> {
    fn wrap_err<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn wrap_err<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|source| Error::Context {
            context: f().to_string(),
            source: Box::new(source),
        })
    }
}
