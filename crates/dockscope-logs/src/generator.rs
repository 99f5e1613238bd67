use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dockscope_types::{LogEvent, StdType};

use crate::frame::{FrameError, FrameReader};
use crate::grouper::{Grouper, Record};
use crate::parser::LogParser;

/// Tuning for the event generator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Capacity of the buffer between the reading and grouping tasks
    pub buffer_size: usize,

    /// How long to wait for the next record before emitting the current one
    pub peek_timeout: Duration,

    /// Records closer than this may belong to the same group
    pub group_window: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            peek_timeout: Duration::from_millis(50),
            group_window: Duration::from_millis(10),
        }
    }
}

/// Turns one container's raw log stream into an ordered stream of grouped events
///
/// A reader task decodes and parses frames into a bounded buffer; a grouper
/// task pulls from it with one record of lookahead and emits the results. A
/// terminal read error closes the output and is reported by [`finish`](Self::finish).
pub struct EventGenerator {
    events: mpsc::Receiver<LogEvent>,
    errors: mpsc::Receiver<FrameError>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl EventGenerator {
    pub fn new<R>(
        reader: FrameReader<R>,
        parser: LogParser,
        container_id: impl Into<String>,
        config: &GeneratorConfig,
        cancel: &CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = cancel.child_token();
        let buffer_size = config.buffer_size.max(1);
        let (record_tx, record_rx) = mpsc::channel(buffer_size);
        let (event_tx, event_rx) = mpsc::channel(buffer_size);
        let (error_tx, error_rx) = mpsc::channel(1);

        let producer = tokio::spawn(produce(
            reader,
            parser,
            container_id.into(),
            record_tx,
            error_tx,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(consume(
            record_rx,
            event_tx,
            Grouper::new(config.group_window),
            config.peek_timeout,
            cancel.clone(),
        ));

        Self {
            events: event_rx,
            errors: error_rx,
            tasks: vec![producer, consumer],
            cancel,
        }
    }

    /// Next grouped event, or None once the stream is drained
    pub async fn next(&mut self) -> Option<LogEvent> {
        self.events.recv().await
    }

    /// Stop both tasks, wait for them, and report a terminal read error if one occurred
    pub async fn finish(mut self) -> Result<(), FrameError> {
        self.events.close();
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "log generator task panicked");
            }
        }
        match self.errors.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for EventGenerator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn produce<R>(
    mut reader: FrameReader<R>,
    parser: LogParser,
    container_id: String,
    records: mpsc::Sender<Record>,
    errors: mpsc::Sender<FrameError>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read() => result,
        };

        let (text, stream) = match result {
            Ok(Some(frame)) => (frame.text, frame.stream),
            Ok(None) => break,
            Err(FrameError::BadHeader { recovered }) => (recovered, StdType::Unknown),
            Err(err) => {
                tracing::debug!(container = %container_id, error = %err, "log stream failed");
                let _ = errors.try_send(err);
                break;
            }
        };

        // Zero-length frames are not emitted
        if text.is_empty() {
            continue;
        }

        let mut event = parser.parse(&text, stream);
        event.container_id = container_id.clone();

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = records.send(Record::new(event)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn consume(
    mut records: mpsc::Receiver<Record>,
    events: mpsc::Sender<LogEvent>,
    grouper: Grouper,
    peek_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Option<Record> = None;

    loop {
        let mut current = match pending.take() {
            Some(record) => record,
            None => {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = records.recv() => received,
                };
                match received {
                    Some(record) => record,
                    None => break,
                }
            }
        };

        // A timeout and a closed buffer both mean there is no next record yet
        let mut next = tokio::select! {
            _ = cancel.cancelled() => break,
            peeked = tokio::time::timeout(peek_timeout, records.recv()) => peeked.ok().flatten(),
        };

        grouper.check(&mut current, next.as_mut());

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = events.send(current.into_event()) => {
                if sent.is_err() {
                    break;
                }
            }
        }

        pending = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;

    use dockscope_client::wire::encode_frame;
    use dockscope_types::{LogLevel, LogMessage, Position};

    use crate::level::LevelClassifier;

    fn parser() -> LogParser {
        LogParser::new(Arc::new(LevelClassifier::new().unwrap()))
    }

    fn framed(lines: &[&str]) -> Vec<u8> {
        lines
            .iter()
            .flat_map(|line| encode_frame(StdType::Stdout, line.as_bytes()))
            .collect()
    }

    fn generator(bytes: Vec<u8>, tty: bool) -> EventGenerator {
        let reader = FrameReader::new(std::io::Cursor::new(bytes), tty);
        EventGenerator::new(
            reader,
            parser(),
            "abc123",
            &GeneratorConfig::default(),
            &CancellationToken::new(),
        )
    }

    async fn collect(mut generator: EventGenerator) -> (Vec<LogEvent>, Result<(), FrameError>) {
        let mut events = Vec::new();
        while let Some(event) = generator.next().await {
            events.push(event);
        }
        (events, generator.finish().await)
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let lines: Vec<String> = (0..20)
            .map(|i| format!("2020-05-13T18:55:{:02}Z line {i}\n", i))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

        let (events, result) = collect(generator(framed(&refs), false)).await;
        assert!(result.is_ok());
        assert_eq!(events.len(), 20);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.message, LogMessage::Text(format!("line {i}")));
            assert_eq!(event.container_id, "abc123");
        }
    }

    #[tokio::test]
    async fn test_groups_stack_trace() {
        let bytes = framed(&[
            "2020-05-13T18:55:37.100Z ERROR panic: boom\n",
            "2020-05-13T18:55:37.101Z goroutine 1 [running]:\n",
            "2020-05-13T18:55:37.102Z main.main()\n",
            "2020-05-13T18:55:39.000Z INFO restarting\n",
        ]);

        let (events, _) = collect(generator(bytes, false)).await;
        let positions: Vec<_> = events.iter().map(|e| e.position).collect();
        assert_eq!(
            positions,
            vec![
                Some(Position::Beginning),
                Some(Position::Middle),
                Some(Position::End),
                None
            ]
        );
        assert_eq!(events[1].level, LogLevel::Error);
        assert_eq!(events[2].level, LogLevel::Error);
        assert_eq!(events[3].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_skips_empty_frames() {
        let bytes = framed(&["2020-05-13T18:55:37Z one\n", "", "2020-05-13T18:55:38Z two\n"]);
        let (events, _) = collect(generator(bytes, false)).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_truncated_stream_reports_error() {
        let mut bytes = framed(&["2020-05-13T18:55:37Z one\n", "2020-05-13T18:55:38Z two\n"]);
        bytes.truncate(bytes.len() - 4);

        let (events, result) = collect(generator(bytes, false)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn test_bad_header_does_not_stop_stream() {
        let mut bytes = framed(&["2020-05-13T18:55:37Z one\n"]);
        bytes.extend_from_slice(&[1, 0, 0]);

        let (events, result) = collect(generator(bytes, false)).await;
        assert!(result.is_ok());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stream, StdType::Unknown);
    }

    #[tokio::test]
    async fn test_tty_stream() {
        let bytes = b"2020-05-13T18:55:37Z hello\n2020-05-13T18:55:38Z world\n".to_vec();
        let (events, _) = collect(generator(bytes, true)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, LogMessage::Text("world".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_before_next_record_arrives() {
        let (client, mut server) = tokio::io::duplex(1024);
        let reader = FrameReader::new(client, false);
        let mut generator = EventGenerator::new(
            reader,
            parser(),
            "abc123",
            &GeneratorConfig::default(),
            &CancellationToken::new(),
        );

        server
            .write_all(&encode_frame(StdType::Stdout, b"2020-05-13T18:55:37Z waiting\n"))
            .await
            .unwrap();

        // The writer stays open, so only the peek timeout lets this through
        let event = generator.next().await.unwrap();
        assert_eq!(event.message, LogMessage::Text("waiting".to_string()));
        assert!(event.position.is_none());

        generator.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_generator() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut generator = EventGenerator::new(
            FrameReader::new(client, false),
            parser(),
            "abc123",
            &GeneratorConfig::default(),
            &cancel,
        );

        cancel.cancel();
        assert!(generator.next().await.is_none());
        assert!(generator.finish().await.is_ok());
    }
}
