use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dockscope_client::{ClientError, ContainerClient};
use dockscope_types::{ContainerStat, LabelFilter, STATS_HISTORY};

use crate::subscribers::SubscriberRegistry;

/// Tuning for the stats collector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsConfig {
    /// How long a session lingers with no subscribers before it is torn down
    pub idle_timeout: Duration,

    /// Capacity of each subscriber channel
    pub subscriber_buffer: usize,

    /// Samples kept per container
    pub history: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(6 * 60 * 60),
            subscriber_buffer: 64,
            history: STATS_HISTORY,
        }
    }
}

/// A running collection session
struct Session {
    stop: CancellationToken,
    samples: mpsc::Sender<ContainerStat>,
}

struct Sampler {
    generation: u64,
    cancel: CancellationToken,
}

struct StatsInner {
    client: Arc<dyn ContainerClient>,
    filter: LabelFilter,
    config: StatsConfig,
    subscribers: Arc<SubscriberRegistry<ContainerStat>>,
    samplers: DashMap<String, Sampler>,
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    active: AtomicUsize,
    cancel: CancellationToken,
}

/// Demand-driven CPU and memory sampling
///
/// One shared session samples every running container while at least one
/// caller holds a reference through [`start`](Self::start). When the count drops
/// to zero an idle timer is armed; if nobody starts again before it fires, the
/// session and all samplers are torn down.
#[derive(Clone)]
pub struct StatsCollector {
    inner: Arc<StatsInner>,
}

impl StatsCollector {
    pub fn new(
        client: Arc<dyn ContainerClient>,
        filter: LabelFilter,
        config: StatsConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let subscribers = Arc::new(SubscriberRegistry::new("stats", config.subscriber_buffer));
        Self {
            inner: Arc::new(StatsInner {
                client,
                filter,
                config,
                subscribers,
                samplers: DashMap::new(),
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                idle_timer: Mutex::new(None),
                active: AtomicUsize::new(0),
                cancel: cancel.clone(),
            }),
        }
    }

    /// Take a reference on the session, starting it if needed.
    /// Returns true if this call started a new session.
    pub fn start(&self) -> bool {
        self.cancel_idle_timer();
        self.inner.active.fetch_add(1, Ordering::SeqCst);

        let mut session = self.inner.session.lock();
        if session.is_some() {
            return false;
        }

        let stop = self.inner.cancel.child_token();
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        *session = Some(Session {
            stop: stop.clone(),
            samples: tx.clone(),
        });
        drop(session);

        tracing::debug!(host = %self.inner.client.host().name, "stats session started");
        tokio::spawn(run_session(self.clone(), stop, tx, rx));
        true
    }

    /// Release a reference; the last release arms the idle timer
    pub fn stop(&self) {
        let previous = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }

        let collector = self.clone();
        let timeout = self.inner.config.idle_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if collector.inner.active.load(Ordering::SeqCst) == 0 {
                collector.force_stop();
            }
        });
        if let Some(previous) = self.inner.idle_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Start/stop pair tied to a guard's lifetime
    pub fn acquire(&self) -> StatsGuard {
        self.start();
        StatsGuard {
            collector: self.clone(),
        }
    }

    /// Tear the session down immediately
    pub fn force_stop(&self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.stop.cancel();
            tracing::debug!(host = %self.inner.client.host().name, "stats session stopped");
        }
        self.inner.samplers.retain(|_, sampler| {
            sampler.cancel.cancel();
            false
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Number of outstanding `start` references
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, done: CancellationToken) -> mpsc::Receiver<ContainerStat> {
        self.inner.subscribers.subscribe(done)
    }

    /// Begin sampling a container if a session is running
    pub fn container_started(&self, id: &str) {
        let session = self.inner.session.lock();
        let Some(session) = session.as_ref() else {
            return;
        };
        self.spawn_sampler(id, &session.stop, session.samples.clone());
    }

    /// Stop sampling a container
    pub fn container_died(&self, id: &str) {
        if let Some((_, sampler)) = self.inner.samplers.remove(id) {
            sampler.cancel.cancel();
            tracing::trace!(id, "sampler stopped");
        }
    }

    /// IDs currently being sampled
    pub fn sampling(&self) -> Vec<String> {
        self.inner.samplers.iter().map(|s| s.key().clone()).collect()
    }

    fn spawn_sampler(&self, id: &str, stop: &CancellationToken, samples: mpsc::Sender<ContainerStat>) {
        let Entry::Vacant(slot) = self.inner.samplers.entry(id.to_string()) else {
            return;
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = stop.child_token();
        slot.insert(Sampler {
            generation,
            cancel: cancel.clone(),
        });

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            match inner.client.container_stats(&id, cancel, samples).await {
                Ok(()) | Err(ClientError::Cancelled) => {}
                Err(e) => tracing::error!(id = %id, error = %e, "stats sampler failed"),
            }
            inner
                .samplers
                .remove_if(&id, |_, sampler| sampler.generation == generation);
        });
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.inner.idle_timer.lock().take() {
            timer.abort();
        }
    }
}

async fn run_session(
    collector: StatsCollector,
    stop: CancellationToken,
    samples: mpsc::Sender<ContainerStat>,
    mut rx: mpsc::Receiver<ContainerStat>,
) {
    let inner = &collector.inner;
    match inner.client.list_containers(&inner.filter).await {
        Ok(containers) => {
            for container in containers.iter().filter(|c| c.is_running()) {
                collector.spawn_sampler(&container.id, &stop, samples.clone());
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to list containers for stats"),
    }
    drop(samples);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            stat = rx.recv() => match stat {
                Some(stat) => inner.subscribers.broadcast(&stat),
                None => break,
            },
        }
    }
}

/// Holds a stats session reference until dropped
pub struct StatsGuard {
    collector: StatsCollector,
}

impl Drop for StatsGuard {
    fn drop(&mut self) {
        self.collector.stop();
    }
}
