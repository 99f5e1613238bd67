use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dockscope_client::{ContainerClient, LogOptions};
use dockscope_types::{Container, LogEvent};

use crate::frame::FrameReader;
use crate::generator::{EventGenerator, GeneratorConfig};
use crate::parser::LogParser;

/// Manages log streaming from multiple containers
///
/// Each container gets its own [`EventGenerator`]; all of them feed one shared
/// channel. Order is kept per container, not across containers.
pub struct LogStreamManager {
    /// Cancellation token for stopping streams
    cancel: CancellationToken,

    /// Active stream task handles
    tasks: Vec<tokio::task::JoinHandle<()>>,

    parser: LogParser,
    config: GeneratorConfig,
}

impl LogStreamManager {
    pub fn new(parser: LogParser, config: GeneratorConfig) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            parser,
            config,
        }
    }

    /// Start streaming logs from all containers
    pub fn start_streams(
        &mut self,
        client: Arc<dyn ContainerClient>,
        containers: &[Container],
        log_tx: mpsc::Sender<LogEvent>,
        options: &LogOptions,
    ) {
        for container in containers {
            let task = self.spawn_container_stream(
                Arc::clone(&client),
                container.id.clone(),
                container.tty,
                log_tx.clone(),
                options.clone(),
            );
            self.tasks.push(task);
        }
    }

    fn spawn_container_stream(
        &self,
        client: Arc<dyn ContainerClient>,
        container_id: String,
        tty: bool,
        log_tx: mpsc::Sender<LogEvent>,
        options: LogOptions,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        let parser = self.parser.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let stream = match client.container_logs(&container_id, &options).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(id = %container_id, error = %e, "failed to open log stream");
                    return;
                }
            };

            let reader = FrameReader::new(stream, tty);
            let mut generator = EventGenerator::new(reader, parser, &container_id, &config, &cancel);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = generator.next() => {
                        let Some(event) = event else { break };
                        // Channel closed, stop streaming
                        if log_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = generator.finish().await {
                tracing::warn!(id = %container_id, error = %e, "log stream ended with error");
            }
        })
    }

    /// Stop all streams
    pub fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Create a fresh cancellation token for future streams
        self.cancel = CancellationToken::new();
    }
}

impl Drop for LogStreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}
