//! Docker Engine adapter built on bollard

use std::fmt::Display;
use std::io;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerInspectResponse, ContainerStatsResponse, ContainerSummary, EventMessage};
use bollard::query_parameters::{
    EventsOptions, InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder, StatsOptions,
    StatsOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use dockscope_types::{
    Container, ContainerEvent, ContainerStat, ContainerState, HealthStatus, Host, LabelFilter,
    StdType,
};

use crate::client::{ClientError, ContainerClient, LogOptions, LogStream};
use crate::wire::encode_frame;

/// Seconds before a request to the daemon times out
const CONNECT_TIMEOUT: u64 = 120;

/// Runtime IDs are shortened to this many characters
const SHORT_ID_LEN: usize = 12;

/// Client for one Docker Engine daemon
pub struct DockerClient {
    docker: Docker,
    host: Host,
}

impl DockerClient {
    /// Connect to a daemon and read its host information.
    ///
    /// With no endpoint the local defaults are used (`DOCKER_HOST` or the
    /// platform socket). `unix://` endpoints use the socket transport, anything
    /// else is treated as an HTTP address.
    pub async fn connect(name: &str, endpoint: Option<&str>) -> Result<Self, ClientError> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults()?,
            Some(ep) if ep.starts_with("unix://") || ep.starts_with("npipe://") => {
                Docker::connect_with_socket(ep, CONNECT_TIMEOUT, API_DEFAULT_VERSION)?
            }
            Some(ep) => Docker::connect_with_http(ep, CONNECT_TIMEOUT, API_DEFAULT_VERSION)?,
        };

        let info = docker.info().await?;
        let host = Host {
            id: info.id.unwrap_or_else(|| name.to_string()),
            name: name.to_string(),
            endpoint: endpoint.unwrap_or("local").to_string(),
            n_cpu: info.ncpu.unwrap_or_default().max(0) as u32,
            mem_total: info.mem_total.unwrap_or_default().max(0) as u64,
        };

        tracing::info!(host = %host.name, id = %host.id, cpus = host.n_cpu, "connected to docker");
        Ok(Self { docker, host })
    }

    fn summary_to_container(&self, summary: ContainerSummary) -> Container {
        let mut container = Container::new(short_id(summary.id.as_deref().unwrap_or_default()));
        container.name = summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default();
        container.image = summary.image.unwrap_or_default();
        container.command = summary.command.unwrap_or_default();
        container.created = summary
            .created
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        container.state = summary
            .state
            .map(|state| ContainerState::from(state.to_string().as_str()))
            .unwrap_or_default();
        container.health = summary.status.as_deref().and_then(health_from_status);
        container.labels = summary.labels.unwrap_or_default();
        container.host = self.host.id.clone();
        container.with_group_from_labels()
    }

    fn inspect_to_container(&self, inspect: ContainerInspectResponse) -> Container {
        let mut container = Container::new(short_id(inspect.id.as_deref().unwrap_or_default()));
        container.name = inspect
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default();
        container.created = inspect.created.as_ref().and_then(parse_date);
        container.host = self.host.id.clone();

        if let Some(config) = inspect.config {
            container.image = config.image.unwrap_or_default();
            container.command = config.cmd.map(|cmd| cmd.join(" ")).unwrap_or_default();
            container.tty = config.tty.unwrap_or(false);
            container.labels = config.labels.unwrap_or_default();
        }

        if let Some(state) = inspect.state {
            container.state = state
                .status
                .map(|status| ContainerState::from(status.to_string().as_str()))
                .unwrap_or_default();
            container.started_at = state.started_at.as_ref().and_then(parse_date);
            container.finished_at = state.finished_at.as_ref().and_then(parse_date);
            container.health = state
                .health
                .and_then(|health| health.status)
                .and_then(|status| HealthStatus::parse(&status.to_string()));
        }

        container.fully_loaded = true;
        container.with_group_from_labels()
    }

    fn event_from_message(&self, message: EventMessage) -> Option<ContainerEvent> {
        let action = message.action?;
        let actor = message.actor?;
        let id = short_id(actor.id.as_deref()?);

        let mut event = ContainerEvent::new(action, id, self.host.id.clone());
        event.actor_attributes = actor.attributes.unwrap_or_default();
        if let Some(time) = message
            .time_nano
            .map(DateTime::from_timestamp_nanos)
            .or_else(|| message.time.and_then(|secs| DateTime::from_timestamp(secs, 0)))
        {
            event.time = time;
        }
        Some(event)
    }
}

#[async_trait]
impl ContainerClient for DockerClient {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<Container>, ClientError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();
        let summaries = self.docker.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .map(|summary| self.summary_to_container(summary))
            .filter(|container| filter.matches(&container.labels))
            .collect())
    }

    async fn find_container(&self, id: &str) -> Result<Container, ClientError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        match self.docker.inspect_container(id, Some(options)).await {
            Ok(inspect) => Ok(self.inspect_to_container(inspect)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ClientError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, ClientError> {
        let tail = options
            .tail
            .map(|n| n.to_string())
            .unwrap_or_else(|| "all".to_string());
        let mut builder = LogsOptionsBuilder::new()
            .follow(options.follow)
            .stdout(options.std_types.stdout)
            .stderr(options.std_types.stderr)
            .timestamps(true)
            .tail(&tail);
        if let Some(since) = options.since {
            builder = builder.since(since_seconds(since));
        }
        let logs_options: LogsOptions = builder.build();

        // Re-frame the demultiplexed output so every adapter hands out the same wire format
        let stream = self
            .docker
            .logs(id, Some(logs_options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => {
                        Some(Ok(encode_frame(StdType::Stdout, &message)))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(encode_frame(StdType::Stderr, &message)))
                    }
                    Ok(LogOutput::Console { message }) => Some(Ok::<Bytes, io::Error>(message)),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    }) => Some(Err(io::Error::new(io::ErrorKind::NotFound, "container not found"))),
                    Err(e) => Some(Err(io::Error::other(e))),
                }
            });

        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn container_events(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<ContainerEvent>,
    ) -> Result<(), ClientError> {
        let mut stream = self.docker.events(None::<EventsOptions>);
        tracing::debug!(host = %self.host.name, "event feed opened");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                item = stream.next() => {
                    let message = match item {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "event stream closed",
                            )
                            .into());
                        }
                    };

                    let is_container = message
                        .typ
                        .as_ref()
                        .is_some_and(|typ| typ.to_string() == "container");
                    if !is_container {
                        continue;
                    }

                    if let Some(event) = self.event_from_message(message) {
                        tracing::trace!(name = %event.name, id = %event.actor_id, "container event");
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn container_stats(
        &self,
        id: &str,
        cancel: CancellationToken,
        stats: mpsc::Sender<ContainerStat>,
    ) -> Result<(), ClientError> {
        let options: StatsOptions = StatsOptionsBuilder::new().stream(true).build();
        let mut stream = self.docker.stats(id, Some(options));
        let short = short_id(id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => {
                    let response = match item {
                        Some(Ok(response)) => response,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };

                    let Some(stat) = StatsSample::from_response(&response).into_stat(&short) else {
                        continue;
                    };
                    if stats.send(stat).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Raw counters from one stats response
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system: u64,
    pub presystem: u64,
    pub online_cpus: u64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    /// `total_inactive_file` on cgroup v1, `inactive_file` on v2
    pub mem_inactive: Option<u64>,
}

impl StatsSample {
    fn from_response(response: &ContainerStatsResponse) -> Self {
        let cpu = response.cpu_stats.as_ref();
        let precpu = response.precpu_stats.as_ref();
        let memory = response.memory_stats.as_ref();

        let online_cpus = cpu
            .and_then(|c| c.online_cpus)
            .map(u64::from)
            .filter(|n| *n > 0)
            .or_else(|| {
                cpu.and_then(|c| c.cpu_usage.as_ref())
                    .and_then(|u| u.percpu_usage.as_ref())
                    .map(|per| per.len() as u64)
            })
            .unwrap_or(1);

        let inactive = memory.and_then(|m| m.stats.as_ref()).and_then(|stats| {
            stats
                .get("total_inactive_file")
                .or_else(|| stats.get("inactive_file"))
                .copied()
        });

        Self {
            cpu_total: cpu
                .and_then(|c| c.cpu_usage.as_ref())
                .and_then(|u| u.total_usage)
                .unwrap_or_default(),
            precpu_total: precpu
                .and_then(|c| c.cpu_usage.as_ref())
                .and_then(|u| u.total_usage)
                .unwrap_or_default(),
            system: cpu.and_then(|c| c.system_cpu_usage).unwrap_or_default(),
            presystem: precpu.and_then(|c| c.system_cpu_usage).unwrap_or_default(),
            online_cpus,
            mem_usage: memory.and_then(|m| m.usage).unwrap_or_default(),
            mem_limit: memory.and_then(|m| m.limit).unwrap_or_default(),
            mem_inactive: inactive,
        }
    }

    /// Convert raw counters to a sample. Returns None when there is nothing to report.
    pub fn into_stat(self, id: &str) -> Option<ContainerStat> {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total) as f64;
        let system_delta = self.system.saturating_sub(self.presystem) as f64;
        let cpu_percent = if cpu_delta > 0.0 && system_delta > 0.0 {
            cpu_delta / system_delta * self.online_cpus as f64 * 100.0
        } else {
            0.0
        };

        let memory_usage = match self.mem_inactive {
            Some(inactive) if inactive < self.mem_usage => self.mem_usage - inactive,
            _ => self.mem_usage,
        };
        let memory_percent = if self.mem_limit > 0 {
            memory_usage as f64 / self.mem_limit as f64 * 100.0
        } else {
            0.0
        };

        if cpu_percent == 0.0 && memory_usage == 0 {
            return None;
        }

        Some(ContainerStat {
            id: id.to_string(),
            cpu_percent,
            memory_percent,
            memory_usage,
        })
    }
}

/// Unix seconds for the daemon's `since` parameter, saturating at the i32 range it accepts
fn since_seconds(since: DateTime<Utc>) -> i32 {
    since.timestamp().clamp(0, i64::from(i32::MAX)) as i32
}

/// Shorten a runtime ID the way container IDs are stored
pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Extract health from a list status such as `Up 2 minutes (healthy)`
fn health_from_status(status: &str) -> Option<HealthStatus> {
    let start = status.rfind('(')?;
    let end = status[start..].find(')')? + start;
    let inner = &status[start + 1..end];
    HealthStatus::parse(inner.strip_prefix("health: ").unwrap_or(inner))
}

/// Parse a daemon timestamp, dropping the zero value the API uses for "never"
fn parse_date(value: &impl Display) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value.to_string())
        .ok()
        .map(|date| date.with_timezone(&Utc))
        .filter(|date| date.year() > 1)
}
