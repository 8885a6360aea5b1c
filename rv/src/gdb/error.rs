use thiserror::Error;

#[derive(Debug, Error)]
pub enum GdbError {
    #[error("failed to read from client socket: {0}")]
    ReadError(#[source] std::io::Error),
    #[error("client disconnected before sending a full packet")]
    UnexpectedEof,
    #[error("failed to write to client socket: {0}")]
    WriteError(#[source] std::io::Error),
    #[error("failed to create server socket: {0}")]
    CreateSocketError(#[source] std::io::Error),
    #[error("failed to bind server socket: {0}")]
    BindError(#[source] std::io::Error),
    #[error("failed to listen on server socket: {0}")]
    ListenError(#[source] std::io::Error),
}
