use thiserror::Error;

/// Framing-level failures. These are unrecoverable for the connection that
/// produced them: the session logs the error and drops the socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported RESP type byte `{0}`")]
    UnknownType(char),
    #[error("malformed length prefix")]
    BadLength,
    #[error("bulk string payload does not end with CRLF")]
    MissingTerminator,
    #[error("simple string is not valid UTF-8")]
    NotUtf8,
}

/// Client-visible command failures. The `Display` string is the exact RESP
/// error payload written back to the client (the `-` and CRLF framing are
/// added by the encoder).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    BadStreamId,
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),
    #[error("ERR syntax error")]
    Syntax,
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
    #[error("ERR timeout is negative")]
    NegativeTimeout,
    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,
    #[error("ERR {0} is not allowed in transactions")]
    NotAllowedInTransaction(&'static str),
    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,
    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,
    #[error("READONLY You can't write against a read only replica.")]
    ReadOnlyReplica,
}
