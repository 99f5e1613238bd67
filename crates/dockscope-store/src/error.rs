use thiserror::Error;

use dockscope_client::ClientError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error(transparent)]
    Client(ClientError),
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(id) => Self::ContainerNotFound(id),
            err => Self::Client(err),
        }
    }
}
