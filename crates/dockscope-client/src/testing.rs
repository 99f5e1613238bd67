//! In-memory client for tests

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use dockscope_types::{Container, ContainerEvent, ContainerStat, Host, LabelFilter};

use crate::client::{ClientError, ContainerClient, LogOptions, LogStream};

/// Scriptable [`ContainerClient`] backed by in-memory state
pub struct FakeClient {
    host: Host,
    containers: Mutex<Vec<Container>>,
    logs: Mutex<HashMap<String, Bytes>>,
    stats: Mutex<HashMap<String, Vec<ContainerStat>>>,
    feeds: Mutex<Vec<mpsc::Sender<ContainerEvent>>>,
    feed_opened: Notify,
    disconnect: Notify,
    list_fails: Mutex<bool>,
    stopped_samplers: Mutex<HashSet<String>>,
    failing_samplers: Mutex<HashSet<String>>,
    sampler_starts: Mutex<HashMap<String, usize>>,
    inspect_delay: Mutex<Option<Duration>>,
    inspect_calls: AtomicUsize,
    inspects_in_flight: AtomicUsize,
    peak_inspects: AtomicUsize,
    list_calls: AtomicUsize,
}

/// Counts an inspect as in flight until dropped, including when a timeout drops it
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeClient {
    pub fn new(host_id: &str) -> Self {
        Self {
            host: Host::new(host_id, host_id),
            containers: Mutex::new(Vec::new()),
            logs: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
            feed_opened: Notify::new(),
            disconnect: Notify::new(),
            list_fails: Mutex::new(false),
            stopped_samplers: Mutex::new(HashSet::new()),
            failing_samplers: Mutex::new(HashSet::new()),
            sampler_starts: Mutex::new(HashMap::new()),
            inspect_delay: Mutex::new(None),
            inspect_calls: AtomicUsize::new(0),
            inspects_in_flight: AtomicUsize::new(0),
            peak_inspects: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Add or replace a container on the fake host
    pub fn put_container(&self, mut container: Container) {
        container.host = self.host.id.clone();
        let mut containers = self.containers.lock();
        containers.retain(|c| c.id != container.id);
        containers.push(container);
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().retain(|c| c.id != id);
    }

    /// Raw bytes returned by `container_logs` for `id`
    pub fn set_logs(&self, id: &str, bytes: impl Into<Bytes>) {
        self.logs.lock().insert(id.to_string(), bytes.into());
    }

    /// Samples emitted by `container_stats` for `id`, after which the sampler waits for cancellation
    pub fn set_stats(&self, id: &str, samples: Vec<ContainerStat>) {
        self.stats.lock().insert(id.to_string(), samples);
    }

    pub fn set_list_fails(&self, fails: bool) {
        *self.list_fails.lock() = fails;
    }

    /// Make every `find_container` call take `delay` before answering
    pub fn set_inspect_delay(&self, delay: Duration) {
        *self.inspect_delay.lock() = Some(delay);
    }

    /// Make the sampler for `id` fail as soon as it starts
    pub fn set_stats_error(&self, id: &str) {
        self.failing_samplers.lock().insert(id.to_string());
    }

    /// Deliver an event to every open feed, waiting until one is open
    pub async fn emit(&self, event: ContainerEvent) {
        loop {
            let notified = self.feed_opened.notified();
            let feeds: Vec<_> = self.feeds.lock().clone();
            let mut delivered = false;
            for feed in feeds {
                if feed.send(event.clone()).await.is_ok() {
                    delivered = true;
                }
            }
            if delivered {
                return;
            }
            notified.await;
        }
    }

    /// Break every open event feed as if the daemon went away
    pub fn disconnect(&self) {
        self.feeds.lock().clear();
        self.disconnect.notify_waiters();
    }

    /// Number of open event feeds
    pub fn feed_count(&self) -> usize {
        self.feeds.lock().iter().filter(|f| !f.is_closed()).count()
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `find_container` calls seen running at once
    pub fn peak_inspects(&self) -> usize {
        self.peak_inspects.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// How many times `container_stats` was opened for `id`
    pub fn sampler_starts(&self, id: &str) -> usize {
        self.sampler_starts.lock().get(id).copied().unwrap_or_default()
    }

    /// Whether the sampler for `id` has been cancelled
    pub fn sampler_stopped(&self, id: &str) -> bool {
        self.stopped_samplers.lock().contains(id)
    }
}

#[async_trait]
impl ContainerClient for FakeClient {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<Container>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if *self.list_fails.lock() {
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "daemon down").into());
        }
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .cloned()
            .map(|mut c| {
                c.fully_loaded = false;
                c
            })
            .collect())
    }

    async fn find_container(&self, id: &str) -> Result<Container, ClientError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.inspects_in_flight, &self.peak_inspects);
        let delay = *self.inspect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.containers
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .map(|mut c| {
                c.fully_loaded = true;
                c
            })
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn container_logs(&self, id: &str, _options: &LogOptions) -> Result<LogStream, ClientError> {
        let bytes = self
            .logs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn container_events(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<ContainerEvent>,
    ) -> Result<(), ClientError> {
        let disconnected = self.disconnect.notified();
        tokio::pin!(disconnected);
        disconnected.as_mut().enable();

        self.feeds.lock().push(events.clone());
        self.feed_opened.notify_waiters();

        tokio::select! {
            _ = cancel.cancelled() => {
                self.feeds.lock().retain(|f| !f.same_channel(&events));
                Err(ClientError::Cancelled)
            }
            _ = &mut disconnected => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "event stream closed",
            )
            .into()),
            _ = events.closed() => Ok(()),
        }
    }

    async fn container_stats(
        &self,
        id: &str,
        cancel: CancellationToken,
        stats: mpsc::Sender<ContainerStat>,
    ) -> Result<(), ClientError> {
        *self.sampler_starts.lock().entry(id.to_string()).or_default() += 1;
        if self.failing_samplers.lock().contains(id) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stats stream broke").into());
        }

        let samples = self.stats.lock().get(id).cloned().unwrap_or_default();
        for sample in samples {
            if stats.send(sample).await.is_err() {
                return Ok(());
            }
        }
        cancel.cancelled().await;
        self.stopped_samplers.lock().insert(id.to_string());
        Ok(())
    }
}
