use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("connection closed by {0}")]
    ConnectionClosed(String),

    /// Error reply sent back by the server (`-ERR ...`)
    #[error("{0}")]
    Server(String),

    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("no sentinels were available after {attempts} attempts")]
    NoSentinelsAvailable {
        attempts: usize,
        #[source]
        last: Option<Box<Error>>,
    },

    #[error("no master found in: {0}")]
    NoMasterFound(String),

    #[error("master host '{host}' reported role '{role}'")]
    InvalidMaster { host: String, role: String },

    #[error("max wait between sentinel lookups elapsed: {0:?}")]
    MasterWaitElapsed(std::time::Duration),

    #[error("subscription cancelled")]
    Cancelled,

    #[error("object has been disposed")]
    Disposed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient connectivity failures that are worth retrying on another host
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Timeout(_)
                | Error::ConnectionClosed(_)
                | Error::Io(_)
                | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("reading reply").is_transient());
        assert!(Error::ConnectionClosed("10.0.0.1:6379".into()).is_transient());
        assert!(!Error::Config("empty master list".into()).is_transient());
        assert!(!Error::Disposed.is_transient());
    }

    #[test]
    fn test_no_sentinels_message() {
        let err = Error::NoSentinelsAvailable {
            attempts: 5,
            last: Some(Box::new(Error::Timeout("connecting"))),
        };
        assert_eq!(
            err.to_string(),
            "no sentinels were available after 5 attempts"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
