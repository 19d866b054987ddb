use thiserror::Error;

/// Failures a registration attempt can surface to the caller. Never crosses
/// a session boundary — the handler maps every variant to a request
/// failure/log line and keeps the connection open.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("this port is already allocated")]
    AlreadyAllocated,

    #[error("binding listener: {0}")]
    Bind(#[from] std::io::Error),
}
