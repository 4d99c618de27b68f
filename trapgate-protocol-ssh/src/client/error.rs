#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("Could not resolve address")]
    Resolve,

    #[error("Authentication failed")]
    Authentication,

    #[error("Timed out waiting for the backend")]
    Timeout,
}
