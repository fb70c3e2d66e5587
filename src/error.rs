use std::time::Duration;

use thiserror::Error;

use crate::protocol::reply::SpamdReply;

#[derive(Error, Debug)]
pub enum SpamdError {
    /// Invalid client configuration; the message is fully formatted at the
    /// point the problem is detected.
    #[error("{0}")]
    Config(String),

    /// The body length could not be derived without consuming the reader,
    /// so the Content-length header cannot be framed.
    #[error("The content length could not be determined")]
    NoSize,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The connection was closed before a status line was produced.
    #[error("Failed to read server response")]
    EmptyResponse,

    /// The per-command deadline elapsed before the exchange completed.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// A reply line failed to match its pattern, or a numeric field failed
    /// to parse. Carries the offending line.
    #[error("Invalid server response: {0}")]
    Protocol(String),

    /// The server answered with a non EX_OK status. The parsed reply is
    /// still delivered, inside the error.
    #[error("{}", .reply.status_message())]
    Status { reply: Box<SpamdReply> },
}

impl SpamdError {
    /// Whether the failure is transient and the caller is invited to retry.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::CommandTimeout(_) => true,
            Self::Status { reply } => reply.status_code.is_temporary(),
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
