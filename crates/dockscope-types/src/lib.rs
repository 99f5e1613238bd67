//! Shared types for dockscope
//!
//! This crate contains data structures used across multiple dockscope crates.

mod ring;

pub use ring::RingBuffer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Stats samples kept per container (~5 minutes at one sample per second)
pub const STATS_HISTORY: usize = 300;

/// Label used to group containers together in the UI
pub const GROUP_LABEL: &str = "dev.dockscope.group";

// ============================================================================
// Host Types
// ============================================================================

/// A container runtime daemon dockscope is connected to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub n_cpu: u32,
    pub mem_total: u64,
}

impl Host {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Container Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
}

impl HealthStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "starting" => Some(Self::Starting),
            _ => None,
        }
    }
}

/// One resource usage sample for a container
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStat {
    pub id: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
}

/// Container metadata as tracked by the container store
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Runtime ID truncated to 12 characters
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: String,
    pub created: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: ContainerState,
    pub health: Option<HealthStatus>,
    pub host: String,
    pub tty: bool,
    pub labels: HashMap<String, String>,
    pub group: Option<String>,
    pub stats: RingBuffer<ContainerStat>,

    /// Whether this entry came from a detailed inspect rather than a bulk list
    #[serde(skip)]
    pub fully_loaded: bool,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            image: String::new(),
            command: String::new(),
            created: None,
            started_at: None,
            finished_at: None,
            state: ContainerState::Unknown,
            health: None,
            host: String::new(),
            tty: false,
            labels: HashMap::new(),
            group: None,
            stats: RingBuffer::new(STATS_HISTORY),
            fully_loaded: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Derive `group` from the container labels
    pub fn with_group_from_labels(mut self) -> Self {
        self.group = self.labels.get(GROUP_LABEL).cloned();
        self
    }
}

/// Recognized container event names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Start,
    Destroy,
    Die,
    Update,
    Rename,
    Health(HealthStatus),
    Other,
}

/// A lifecycle event observed on a host
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEvent {
    pub name: String,
    pub actor_id: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub actor_attributes: HashMap<String, String>,
    pub time: DateTime<Utc>,
}

impl ContainerEvent {
    pub fn new(name: impl Into<String>, actor_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actor_id: actor_id.into(),
            host: host.into(),
            container: None,
            actor_attributes: HashMap::new(),
            time: Utc::now(),
        }
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    pub fn kind(&self) -> EventKind {
        match self.name.as_str() {
            "create" => EventKind::Create,
            "start" => EventKind::Start,
            "destroy" => EventKind::Destroy,
            "die" => EventKind::Die,
            "update" => EventKind::Update,
            "rename" => EventKind::Rename,
            name => match name.strip_prefix("health_status:") {
                Some(status) => HealthStatus::parse(status)
                    .map(EventKind::Health)
                    .unwrap_or(EventKind::Other),
                None => EventKind::Other,
            },
        }
    }
}

/// Multi-valued label filter: every key present must match one of its values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelFilter(BTreeMap<String, Vec<String>>);

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `value` for `key`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check a container's labels against the filter
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.0.iter().all(|(key, allowed)| {
            labels
                .get(key)
                .is_some_and(|value| allowed.iter().any(|a| a == value))
        })
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Which runtime stream a log record came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdType {
    #[default]
    Stdout,
    Stderr,
    Unknown,
}

impl StdType {
    /// Map a multiplexed frame tag to a stream type
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Stdout,
            2 => Self::Stderr,
            _ => Self::Unknown,
        }
    }

    /// Frame tag for this stream type
    pub fn tag(&self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::Unknown => 0,
        }
    }
}

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Fatal,
    #[default]
    Unknown,
}

impl LogLevel {
    /// Canonical levels in detection priority order
    pub const CANONICAL: [LogLevel; 6] = [
        Self::Error,
        Self::Warn,
        Self::Info,
        Self::Debug,
        Self::Trace,
        Self::Fatal,
    ];

    /// Names that mean this level, canonical name first
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Error => &["error", "err"],
            Self::Warn => &["warn", "warning"],
            Self::Info => &["info", "inf"],
            Self::Debug => &["debug", "dbg"],
            Self::Trace => &["trace"],
            Self::Fatal => &["fatal", "sev", "severe", "crit", "critical"],
            Self::Unknown => &[],
        }
    }

    /// Resolve a level name or alias, case-insensitively
    pub fn from_alias(s: &str) -> Self {
        let lower = s.trim().to_lowercase();
        Self::CANONICAL
            .into_iter()
            .find(|level| level.aliases().contains(&lower.as_str()))
            .unwrap_or(Self::Unknown)
    }

    pub fn is_known(&self) -> bool {
        *self != Self::Unknown
    }
}

/// Position of a record inside a multi-line group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    #[serde(rename = "start")]
    Beginning,
    #[serde(rename = "middle")]
    Middle,
    #[serde(rename = "end")]
    End,
}

/// Log payload: plain text or an order-preserving map of fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
    Text(String),
    Fields(Map<String, Value>),
}

impl Default for LogMessage {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl LogMessage {
    /// Check for an explicitly empty message
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(s) if s.is_empty())
    }

    pub fn as_fields(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Text(_) => None,
            Self::Fields(fields) => Some(fields),
        }
    }
}

/// A single normalized log record
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEvent {
    /// FNV-1a hash of the raw line
    pub id: u32,

    #[serde(rename = "m")]
    pub message: LogMessage,

    /// String form of the payload, used for searching
    #[serde(skip)]
    pub raw_message: String,

    /// Milliseconds since epoch, 0 if the line had no timestamp
    #[serde(rename = "ts")]
    pub timestamp: i64,

    #[serde(rename = "l")]
    pub level: LogLevel,

    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(rename = "s")]
    pub stream: StdType,

    #[serde(rename = "c")]
    pub container_id: String,
}

impl LogEvent {
    /// Create a new log event with minimal fields
    pub fn new(id: u32, raw: String, stream: StdType) -> Self {
        Self {
            id,
            message: LogMessage::Text(raw.clone()),
            raw_message: raw,
            timestamp: 0,
            level: LogLevel::Unknown,
            position: None,
            stream,
            container_id: String::new(),
        }
    }

    pub fn has_level(&self) -> bool {
        self.level.is_known()
    }

    /// Whether two records are within `window_ms` of each other
    pub fn is_close_to(&self, other: &LogEvent, window_ms: i64) -> bool {
        (self.timestamp - other.timestamp).abs() < window_ms
    }
}
