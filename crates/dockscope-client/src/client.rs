use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dockscope_types::{Container, ContainerEvent, ContainerStat, Host, LabelFilter};

/// Raw log bytes from the runtime: multiplexed frames, or plain lines for TTY containers
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which output streams to request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StdTypes {
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for StdTypes {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
        }
    }
}

/// Options for fetching container logs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open for new output
    pub follow: bool,

    /// Only return output newer than this instant
    pub since: Option<DateTime<Utc>>,

    /// Number of historical lines to fetch (None = everything)
    pub tail: Option<usize>,

    pub std_types: StdTypes,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            since: None,
            tail: Some(300),
            std_types: StdTypes::default(),
        }
    }
}

/// Capabilities dockscope needs from a container runtime
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// The host this client is connected to
    fn host(&self) -> &Host;

    /// Cheap listing of all containers matching `filter`
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<Container>, ClientError>;

    /// Detailed inspect of one container; the result is fully loaded
    async fn find_container(&self, id: &str) -> Result<Container, ClientError>;

    /// Open the raw log stream of a container
    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, ClientError>;

    /// Forward container lifecycle events into `events` until cancelled or the feed breaks.
    /// Returns `ClientError::Cancelled` when `cancel` fired.
    async fn container_events(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<ContainerEvent>,
    ) -> Result<(), ClientError>;

    /// Forward resource samples for one container into `stats` until cancelled or the stream ends
    async fn container_stats(
        &self,
        id: &str,
        cancel: CancellationToken,
        stats: mpsc::Sender<ContainerStat>,
    ) -> Result<(), ClientError>;
}
