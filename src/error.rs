use thiserror::Error;

/// A line failed to parse as a well-formed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing space after prefix")]
    MissingPrefixSpace,

    #[error("empty command")]
    EmptyCommand,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed numeric reply '{0}'")]
    MalformedNumeric(String),
}

/// A directory operation could not be completed, or an invariant would be
/// violated by it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("no such channel '{0}'")]
    NoSuchChannel(String),

    #[error("no such nick '{0}'")]
    NoSuchNick(String),

    #[error("connection {0} is not a member of '{1}'")]
    NotOnChannel(u64, String),

    #[error("connection {0} is already a member of a channel")]
    AlreadyInChannel(u64),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

/// A connection could not continue; it is disconnected but the server
/// survives.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection {id} closed")]
    Closed { id: u64 },

    #[error("connection {id} io error: {source}")]
    Io {
        id: u64,
        #[source]
        source: std::io::Error,
    },
}

/// The event loop cannot continue; the process should exit non-zero.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("directory invariant violated: {0}")]
    Invariant(#[from] DirectoryError),

    #[error("configuration error: {0}")]
    Config(String),
}
