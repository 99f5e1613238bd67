use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dockscope_client::{ClientError, ContainerClient, short_id};
use dockscope_types::{
    Container, ContainerEvent, ContainerStat, ContainerState, EventKind, Host, LabelFilter,
    RingBuffer,
};

use crate::error::StoreError;
use crate::stats::{StatsCollector, StatsConfig};
use crate::subscribers::SubscriberRegistry;

/// Tuning for the container store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum concurrent inspect calls during a resync
    pub fetch_parallelism: usize,

    /// Time limit for each inspect call during a resync
    pub fetch_timeout: Duration,

    /// Capacity of each subscriber channel
    pub subscriber_buffer: usize,

    /// Containers outside this filter are never tracked
    pub filter: LabelFilter,

    pub stats: StatsConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fetch_parallelism: 30,
            fetch_timeout: Duration::from_secs(3),
            subscriber_buffer: 64,
            filter: LabelFilter::default(),
            stats: StatsConfig::default(),
        }
    }
}

struct StoreInner {
    client: Arc<dyn ContainerClient>,
    config: StoreConfig,
    containers: DashMap<String, Container>,
    events: Arc<SubscriberRegistry<ContainerEvent>>,
    new_containers: Arc<SubscriberRegistry<Container>>,
    stats: StatsCollector,
    connected: AtomicBool,
    feed_tx: mpsc::Sender<ContainerEvent>,
    feed_cancel: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// In-memory view of the containers on one host
///
/// The view is rebuilt from a full listing on first use and then kept current
/// by the runtime's event feed. If the feed breaks, the next read resyncs.
#[derive(Clone)]
pub struct ContainerStore {
    inner: Arc<StoreInner>,
}

impl ContainerStore {
    /// Create a store and attempt the initial sync. A failed sync is logged and
    /// retried by the next read.
    pub async fn new(client: Arc<dyn ContainerClient>, config: StoreConfig) -> Self {
        let cancel = CancellationToken::new();
        let buffer = config.subscriber_buffer.max(1);
        let (feed_tx, feed_rx) = mpsc::channel(buffer);

        let stats = StatsCollector::new(
            Arc::clone(&client),
            config.filter.clone(),
            config.stats.clone(),
            &cancel,
        );
        let stats_rx = stats.subscribe(cancel.clone());

        let store = Self {
            inner: Arc::new(StoreInner {
                client,
                events: Arc::new(SubscriberRegistry::new("events", buffer)),
                new_containers: Arc::new(SubscriberRegistry::new("new-containers", buffer)),
                config,
                containers: DashMap::new(),
                stats,
                connected: AtomicBool::new(false),
                feed_tx,
                feed_cancel: Mutex::new(None),
                cancel: cancel.clone(),
            }),
        };

        tokio::spawn(dispatch(Arc::downgrade(&store.inner), feed_rx, stats_rx, cancel));

        // Failures are logged and retried by the next read
        let _ = store.check_connectivity().await;
        store
    }

    pub fn host(&self) -> &Host {
        self.inner.client.host()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.inner.stats
    }

    /// Containers matching `filter`, sorted by name
    pub async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<Container>, StoreError> {
        self.check_connectivity().await?;

        let mut containers: Vec<Container> = self
            .inner
            .containers
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .map(|c| c.value().clone())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(containers)
    }

    /// Look up one container, loading its full details on first access
    pub async fn find_container(&self, id: &str, filter: &LabelFilter) -> Result<Container, StoreError> {
        self.check_connectivity().await?;

        let existing = self.inner.containers.get(id).map(|c| c.value().clone());
        let Some(container) = existing.filter(|c| filter.matches(&c.labels)) else {
            tracing::warn!(id, "container not found");
            return Err(StoreError::ContainerNotFound(id.to_string()));
        };
        if container.fully_loaded {
            return Ok(container);
        }

        let loaded = match self.inner.client.find_container(id).await {
            Ok(loaded) => loaded,
            Err(ClientError::NotFound(_)) => {
                tracing::warn!(id, "container vanished before inspect");
                return Err(StoreError::ContainerNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match self.replace_loaded(loaded) {
            Some(updated) => {
                let event = ContainerEvent::new("update", id, self.host().id.clone())
                    .with_container(updated.clone());
                let events = Arc::clone(&self.inner.events);
                tokio::spawn(async move { events.broadcast(&event) });
                Ok(updated)
            }
            // Another caller won the race, or the container went away
            None => self
                .inner
                .containers
                .get(id)
                .map(|c| c.value().clone())
                .ok_or_else(|| StoreError::ContainerNotFound(id.to_string())),
        }
    }

    /// Look up a container by full or short ID, falling back to its name
    pub async fn resolve(&self, id_or_name: &str) -> Result<Container, StoreError> {
        let wanted = id_or_name.trim_start_matches('/');
        match self.find_container(&short_id(wanted), &LabelFilter::new()).await {
            Err(StoreError::ContainerNotFound(_)) => {}
            found => return found,
        }

        let by_name = self
            .inner
            .containers
            .iter()
            .find(|c| c.name == wanted)
            .map(|c| c.id.clone())
            .ok_or_else(|| StoreError::ContainerNotFound(id_or_name.to_string()))?;
        self.find_container(&by_name, &LabelFilter::new()).await
    }

    pub fn subscribe_events(&self, done: CancellationToken) -> mpsc::Receiver<ContainerEvent> {
        self.inner.events.subscribe(done)
    }

    pub fn subscribe_stats(&self, done: CancellationToken) -> mpsc::Receiver<ContainerStat> {
        self.inner.stats.subscribe(done)
    }

    pub fn subscribe_new_containers(&self, done: CancellationToken) -> mpsc::Receiver<Container> {
        self.inner.new_containers.subscribe(done)
    }

    /// Stop the dispatcher, the event feed and any stats session
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Sync with the runtime unless already connected
    async fn check_connectivity(&self) -> Result<(), StoreError> {
        if self
            .inner
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let feed = self.start_feed();
        if let Err(e) = self.resync().await {
            tracing::error!(host = %self.host().name, error = %e, "container resync failed");
            feed.cancel();
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn start_feed(&self) -> CancellationToken {
        let token = self.inner.cancel.child_token();
        if let Some(previous) = self.inner.feed_cancel.lock().replace(token.clone()) {
            previous.cancel();
        }

        let client = Arc::clone(&self.inner.client);
        let tx = self.inner.feed_tx.clone();
        let inner = Arc::downgrade(&self.inner);
        let feed = token.clone();
        tokio::spawn(async move {
            let result = client.container_events(feed, tx).await;
            match &result {
                Err(ClientError::Cancelled) => {
                    tracing::debug!(host = %client.host().name, "event feed cancelled");
                    return;
                }
                Ok(()) => tracing::debug!(host = %client.host().name, "event feed closed"),
                Err(e) => {
                    tracing::error!(host = %client.host().name, error = %e, "event feed disconnected")
                }
            }
            if let Some(inner) = inner.upgrade() {
                inner.connected.store(false, Ordering::SeqCst);
            }
        });
        token
    }

    async fn resync(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let containers = inner.client.list_containers(&inner.config.filter).await?;

        let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
        for container in containers {
            self.upsert(container);
        }
        inner.containers.retain(|id, _| ids.contains(id));

        let running: Vec<String> = inner
            .containers
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.id.clone())
            .collect();
        let pending: Vec<String> = inner
            .containers
            .iter()
            .filter(|c| c.is_running() && !c.fully_loaded)
            .map(|c| c.id.clone())
            .collect();

        tracing::debug!(
            host = %self.host().name,
            total = ids.len(),
            enrich = pending.len(),
            "containers synced"
        );
        self.enrich(pending).await;

        for id in &running {
            inner.stats.container_started(id);
        }
        Ok(())
    }

    /// Inspect containers concurrently with a bounded number of calls in flight
    async fn enrich(&self, ids: Vec<String>) {
        let limit = Arc::new(Semaphore::new(self.inner.config.fetch_parallelism.max(1)));
        let timeout = self.inner.config.fetch_timeout;
        let mut tasks = JoinSet::new();

        for id in ids {
            let client = Arc::clone(&self.inner.client);
            let limit = Arc::clone(&limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let result = tokio::time::timeout(timeout, client.find_container(&id)).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(container)))) => {
                    self.replace_loaded(container);
                }
                Ok((id, Ok(Err(e)))) => tracing::warn!(id = %id, error = %e, "failed to inspect container"),
                Ok((id, Err(_))) => tracing::warn!(id = %id, "inspect timed out"),
                Err(e) => tracing::error!(error = %e, "inspect task failed"),
            }
        }
    }

    /// Insert or replace a container, keeping its collected stats
    fn upsert(&self, mut container: Container) -> Container {
        container.stats = match self.inner.containers.get(&container.id) {
            Some(existing) => existing.stats.clone(),
            None => RingBuffer::new(self.inner.config.stats.history),
        };
        self.inner.containers.insert(container.id.clone(), container.clone());
        container
    }

    /// Swap in a fully loaded container if the tracked entry is still partial
    fn replace_loaded(&self, loaded: Container) -> Option<Container> {
        let mut entry = self.inner.containers.get_mut(&loaded.id)?;
        if entry.fully_loaded {
            return None;
        }
        let stats = entry.stats.clone();
        *entry = loaded;
        entry.stats = stats;
        Some(entry.clone())
    }

    async fn handle_event(&self, mut event: ContainerEvent) {
        let inner = &self.inner;
        let id = event.actor_id.clone();
        let tracked_before = inner.containers.contains_key(&id);
        let mut synthesized = None;

        match event.kind() {
            kind @ (EventKind::Create | EventKind::Start) => {
                let container = match inner.client.find_container(&id).await {
                    Ok(container) => container,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, event = %event.name, "failed to load container");
                        return;
                    }
                };
                if !inner.config.filter.matches(&container.labels) {
                    tracing::trace!(id = %id, "container outside label filter");
                    return;
                }

                let container = self.upsert(container);
                if kind == EventKind::Start {
                    inner.stats.container_started(&id);
                }
                inner.new_containers.broadcast(&container);
                event.container = Some(container);
            }
            EventKind::Destroy => {
                inner.containers.remove(&id);
                inner.stats.container_died(&id);
            }
            EventKind::Die => {
                if let Some(mut container) = inner.containers.get_mut(&id) {
                    container.state = ContainerState::Exited;
                    container.finished_at = Some(event.time);
                    event.container = Some(container.clone());
                }
                inner.stats.container_died(&id);
            }
            EventKind::Health(health) => {
                if let Some(mut container) = inner.containers.get_mut(&id) {
                    container.health = Some(health);
                    event.container = Some(container.clone());
                }
            }
            EventKind::Rename => {
                let name = match event.actor_attributes.get("name") {
                    Some(name) => Some(name.trim_start_matches('/').to_string()),
                    None => inner.client.find_container(&id).await.ok().map(|c| c.name),
                };
                if let (Some(name), Some(mut container)) = (name, inner.containers.get_mut(&id)) {
                    container.name = name;
                    event.container = Some(container.clone());
                }
            }
            EventKind::Update => {
                let loaded = match inner.client.find_container(&id).await {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "failed to reload updated container");
                        return;
                    }
                };
                if let Some(mut container) = inner.containers.get_mut(&id) {
                    let was_running = container.is_running();
                    merge_mutable(&mut container, loaded);
                    if !was_running && container.is_running() {
                        synthesized = Some(
                            ContainerEvent::new("start", id.clone(), event.host.clone())
                                .with_container(container.clone()),
                        );
                    }
                    event.container = Some(container.clone());
                }
                if synthesized.is_some() {
                    inner.stats.container_started(&id);
                }
            }
            EventKind::Other => {}
        }

        let tracked = tracked_before || inner.containers.contains_key(&id);
        if inner.config.filter.is_empty() || tracked {
            inner.events.broadcast(&event);
            if let Some(start) = synthesized {
                inner.events.broadcast(&start);
            }
        }
    }

    fn record_stat(&self, stat: ContainerStat) {
        match self.inner.containers.get_mut(&stat.id) {
            Some(mut container) => container.stats.push(stat),
            None => tracing::trace!(id = %stat.id, "stat for unknown container dropped"),
        }
    }
}

/// Copy the fields an `update` can change
fn merge_mutable(container: &mut Container, loaded: Container) {
    container.name = loaded.name;
    container.image = loaded.image;
    container.command = loaded.command;
    container.state = loaded.state;
    container.health = loaded.health;
    container.labels = loaded.labels;
    container.group = loaded.group;
    container.started_at = loaded.started_at;
    container.finished_at = loaded.finished_at;
    container.tty = loaded.tty;
    container.fully_loaded = true;
}

/// Single consumer of the event feed and stats samples
async fn dispatch(
    inner: Weak<StoreInner>,
    mut feed: mpsc::Receiver<ContainerEvent>,
    mut stats: mpsc::Receiver<ContainerStat>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(event) = feed.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                ContainerStore { inner }.handle_event(event).await;
            }

            Some(stat) = stats.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                ContainerStore { inner }.record_stat(stat);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use dockscope_client::testing::FakeClient;
    use dockscope_types::HealthStatus;
    use tracing_test::traced_test;

    fn container(id: &str, name: &str, state: ContainerState) -> Container {
        let mut container = Container::new(id);
        container.name = name.to_string();
        container.state = state;
        container
    }

    fn labeled(id: &str, key: &str, value: &str) -> Container {
        let mut container = container(id, id, ContainerState::Running);
        container.labels = HashMap::from([(key.to_string(), value.to_string())]);
        container
    }

    fn event(name: &str, id: &str) -> ContainerEvent {
        ContainerEvent::new(name, id, "local")
    }

    async fn store_with(client: &Arc<FakeClient>, config: StoreConfig) -> ContainerStore {
        ContainerStore::new(client.clone(), config).await
    }

    fn client() -> Arc<FakeClient> {
        let client = Arc::new(FakeClient::new("local"));
        client.put_container(container("aaa", "web", ContainerState::Running));
        client.put_container(container("bbb", "db", ContainerState::Exited));
        client
    }

    /// Poll until `check` holds, failing after a generous number of tries
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initial_sync_enriches_running_containers() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;

        assert!(store.is_connected());
        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        assert!(containers[1].fully_loaded);
        assert!(!containers[0].fully_loaded);
        assert_eq!(client.inspect_calls(), 1);
        assert_eq!(client.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_list_applies_label_filter() {
        let client = Arc::new(FakeClient::new("local"));
        client.put_container(labeled("x1", "a", "x"));
        client.put_container(labeled("y1", "a", "y"));
        let store = store_with(&client, StoreConfig::default()).await;

        let containers = store
            .list_containers(&LabelFilter::new().with("a", "x"))
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "x1");
    }

    #[tokio::test]
    async fn test_configured_filter_limits_tracking() {
        let client = Arc::new(FakeClient::new("local"));
        client.put_container(labeled("x1", "a", "x"));
        client.put_container(labeled("y1", "a", "y"));
        let config = StoreConfig {
            filter: LabelFilter::new().with("a", "x"),
            ..Default::default()
        };
        let store = store_with(&client, config).await;

        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert!(matches!(
            store.find_container("y1", &LabelFilter::new()).await,
            Err(StoreError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_die_marks_container_exited() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut events = store.subscribe_events(CancellationToken::new());

        client.emit(event("die", "aaa")).await;
        let received = events.recv().await.unwrap();
        assert_eq!(received.name, "die");
        assert_eq!(received.container.unwrap().state, ContainerState::Exited);

        let web = store.find_container("aaa", &LabelFilter::new()).await.unwrap();
        assert_eq!(web.state, ContainerState::Exited);
        assert!(web.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_find_loads_lazily_and_announces_update() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut events = store.subscribe_events(CancellationToken::new());
        let calls = client.inspect_calls();

        let db = store.find_container("bbb", &LabelFilter::new()).await.unwrap();
        assert!(db.fully_loaded);
        assert_eq!(client.inspect_calls(), calls + 1);

        let update = events.recv().await.unwrap();
        assert_eq!(update.name, "update");
        assert_eq!(update.actor_id, "bbb");

        store.find_container("bbb", &LabelFilter::new()).await.unwrap();
        assert_eq!(client.inspect_calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_find_unknown_container() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;

        let result = store.find_container("nope", &LabelFilter::new()).await;
        assert!(matches!(result, Err(StoreError::ContainerNotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_resolve_by_full_id_or_name() {
        let client = Arc::new(FakeClient::new("local"));
        client.put_container(container("0123456789ab", "web", ContainerState::Running));
        let store = store_with(&client, StoreConfig::default()).await;

        let full = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(store.resolve(full).await.unwrap().id, "0123456789ab");
        assert_eq!(store.resolve("0123456789ab").await.unwrap().id, "0123456789ab");
        assert_eq!(store.resolve("web").await.unwrap().id, "0123456789ab");
        assert_eq!(store.resolve("/web").await.unwrap().id, "0123456789ab");
        assert!(matches!(
            store.resolve("api").await,
            Err(StoreError::ContainerNotFound(name)) if name == "api"
        ));
    }

    #[tokio::test]
    async fn test_start_inserts_and_notifies() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut new_containers = store.subscribe_new_containers(CancellationToken::new());

        client.put_container(container("ccc", "cache", ContainerState::Running));
        client.emit(event("start", "ccc")).await;

        let added = new_containers.recv().await.unwrap();
        assert_eq!(added.id, "ccc");
        assert!(added.fully_loaded);

        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert!(containers.iter().any(|c| c.id == "ccc"));
    }

    #[tokio::test]
    async fn test_filtered_out_start_is_ignored() {
        let client = Arc::new(FakeClient::new("local"));
        client.put_container(labeled("x1", "a", "x"));
        let config = StoreConfig {
            filter: LabelFilter::new().with("a", "x"),
            ..Default::default()
        };
        let store = store_with(&client, config).await;
        let mut events = store.subscribe_events(CancellationToken::new());
        let mut new_containers = store.subscribe_new_containers(CancellationToken::new());

        client.put_container(labeled("y1", "a", "y"));
        client.emit(event("start", "y1")).await;
        client.emit(event("die", "x1")).await;

        // Events are handled in order, so the die arriving first proves the start was dropped
        let first = events.recv().await.unwrap();
        assert_eq!(first.name, "die");
        assert_eq!(first.actor_id, "x1");
        assert!(new_containers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_removes_container() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut events = store.subscribe_events(CancellationToken::new());

        client.remove_container("bbb");
        client.emit(event("destroy", "bbb")).await;
        assert_eq!(events.recv().await.unwrap().name, "destroy");

        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert!(containers.iter().all(|c| c.id != "bbb"));
    }

    #[tokio::test]
    async fn test_health_and_rename() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut events = store.subscribe_events(CancellationToken::new());

        client.emit(event("health_status: unhealthy", "aaa")).await;
        let mut rename = event("rename", "aaa");
        rename
            .actor_attributes
            .insert("name".to_string(), "/frontend".to_string());
        client.emit(rename).await;

        events.recv().await.unwrap();
        events.recv().await.unwrap();

        let web = store.find_container("aaa", &LabelFilter::new()).await.unwrap();
        assert_eq!(web.health, Some(HealthStatus::Unhealthy));
        assert_eq!(web.name, "frontend");
    }

    #[tokio::test]
    async fn test_update_to_running_synthesizes_start() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let mut events = store.subscribe_events(CancellationToken::new());

        client.put_container(container("bbb", "db", ContainerState::Running));
        client.emit(event("update", "bbb")).await;

        assert_eq!(events.recv().await.unwrap().name, "update");
        let start = events.recv().await.unwrap();
        assert_eq!(start.name, "start");
        assert_eq!(start.actor_id, "bbb");

        let db = store.find_container("bbb", &LabelFilter::new()).await.unwrap();
        assert!(db.is_running());
    }

    #[tokio::test]
    async fn test_stats_are_routed_to_containers() {
        let client = client();
        let sample = ContainerStat {
            id: "aaa".to_string(),
            cpu_percent: 42.0,
            memory_percent: 10.0,
            memory_usage: 2048,
        };
        client.set_stats("aaa", vec![sample.clone()]);
        let store = store_with(&client, StoreConfig::default()).await;
        let mut stats = store.subscribe_stats(CancellationToken::new());

        let _guard = store.stats().acquire();
        assert_eq!(stats.recv().await, Some(sample.clone()));

        let view = store.clone();
        eventually(move || {
            view
                .inner
                .containers
                .get("aaa")
                .is_some_and(|c| c.stats.last() == Some(&sample))
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_stat_is_dropped() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;

        store.record_stat(ContainerStat {
            id: "ghost".to_string(),
            cpu_percent: 1.0,
            memory_percent: 1.0,
            memory_usage: 1,
        });
        assert!(!store.inner.containers.contains_key("ghost"));
    }

    #[tokio::test]
    async fn test_feed_disconnect_triggers_resync() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        eventually(|| client.feed_count() == 1).await;

        client.disconnect();
        let view = store.clone();
        eventually(move || !view.is_connected()).await;

        client.put_container(container("ccc", "cache", ContainerState::Exited));
        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert_eq!(client.list_calls(), 2);
        assert!(containers.iter().any(|c| c.id == "ccc"));
        assert!(store.is_connected());
    }

    #[tokio::test]
    async fn test_failed_sync_is_retried() {
        let client = client();
        client.set_list_fails(true);
        let store = store_with(&client, StoreConfig::default()).await;
        assert!(!store.is_connected());
        assert!(store.list_containers(&LabelFilter::new()).await.is_err());

        client.set_list_fails(false);
        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert_eq!(containers.len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_resync_failure_is_logged() {
        let client = client();
        client.set_list_fails(true);
        let store = store_with(&client, StoreConfig::default()).await;
        assert!(store.list_containers(&LabelFilter::new()).await.is_err());

        assert!(logs_contain("container resync failed"));
        assert_eq!(client.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrichment_respects_parallelism() {
        let client = Arc::new(FakeClient::new("local"));
        for i in 0..12 {
            client.put_container(container(&format!("c{i:02}"), &format!("svc{i:02}"), ContainerState::Running));
        }
        client.set_inspect_delay(Duration::from_millis(20));
        let config = StoreConfig {
            fetch_parallelism: 3,
            ..Default::default()
        };
        let store = store_with(&client, config).await;

        assert_eq!(client.peak_inspects(), 3);
        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        assert_eq!(containers.len(), 12);
        assert!(containers.iter().all(|c| c.fully_loaded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inspect_leaves_entry_partial() {
        let client = client();
        client.set_inspect_delay(Duration::from_secs(10));
        let config = StoreConfig {
            fetch_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let store = store_with(&client, config).await;

        assert!(store.is_connected());
        let containers = store.list_containers(&LabelFilter::new()).await.unwrap();
        let web = containers.iter().find(|c| c.id == "aaa").unwrap();
        assert!(!web.fully_loaded);
        assert_eq!(web.name, "web");
    }

    #[tokio::test]
    async fn test_create_inserts_without_sampling() {
        let client = client();
        let store = store_with(&client, StoreConfig::default()).await;
        let _guard = store.stats().acquire();
        let mut events = store.subscribe_events(CancellationToken::new());
        let mut new_containers = store.subscribe_new_containers(CancellationToken::new());

        client.put_container(container("ccc", "cache", ContainerState::Created));
        client.emit(event("create", "ccc")).await;

        let added = new_containers.recv().await.unwrap();
        assert_eq!(added.id, "ccc");
        let created = events.recv().await.unwrap();
        assert_eq!(created.name, "create");
        assert_eq!(created.container.map(|c| c.state), Some(ContainerState::Created));

        let cache = store.find_container("ccc", &LabelFilter::new()).await.unwrap();
        assert!(cache.fully_loaded);
        assert!(!store.stats().sampling().contains(&"ccc".to_string()));
    }

    #[tokio::test]
    async fn test_stats_history_is_configurable() {
        let client = client();
        let config = StoreConfig {
            stats: StatsConfig {
                history: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = store_with(&client, config).await;

        for cpu in [1.0, 2.0, 3.0] {
            store.record_stat(ContainerStat {
                id: "aaa".to_string(),
                cpu_percent: cpu,
                memory_percent: 1.0,
                memory_usage: 1,
            });
        }
        let web = store.find_container("aaa", &LabelFilter::new()).await.unwrap();
        let cpus: Vec<f64> = web.stats.iter().map(|s| s.cpu_percent).collect();
        assert_eq!(cpus, vec![2.0, 3.0]);
    }
}
