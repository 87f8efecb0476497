#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store failure: {0}")]
    Store(#[from] cairn::Error),

    #[error("registry already finalized")]
    Finalized,

    #[error("failed to spawn watch thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
