use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Local input problem: bucket name, category, time expression, config field.
    Validation(String),
    /// No passphrase could be resolved from any source.
    MissingCredential(String),
    /// Endpoint unreachable or TLS failure.
    Network(String),
    /// Bucket creation rejected by the object store.
    Provisioning { status: u16, body: String },
    /// Engine exited nonzero, timed out, or overflowed the output buffer.
    ProcessExecution(String),
    /// Another engine process holds the repository lock.
    RepositoryLocked(String),
    /// Engine output did not contain the expected structured record.
    ProcessProtocol(String),
    NotFound(String),
    Other(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Other(msg.into())
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(m) => write!(f, "invalid input: {m}"),
            Self::MissingCredential(m) => write!(f, "{m}"),
            Self::Network(m) => write!(f, "network error: {m}"),
            Self::Provisioning { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    write!(f, "bucket provisioning failed with status {status}")
                } else {
                    write!(f, "bucket provisioning failed with status {status}: {body}")
                }
            }
            Self::ProcessExecution(m) => write!(f, "backup engine failed: {m}"),
            Self::RepositoryLocked(m) => write!(f, "repository is locked: {m}"),
            Self::ProcessProtocol(m) => write!(f, "unexpected backup engine output: {m}"),
            Self::NotFound(m) => write!(f, "{m}"),
            Self::Other(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
