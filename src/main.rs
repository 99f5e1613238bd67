mod config;

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dockscope_client::{ContainerClient, DockerClient, LogOptions, StdTypes};
use dockscope_logs::{LevelClassifier, LogFilter, LogParser, LogStreamManager};
use dockscope_store::ContainerStore;
use dockscope_types::{LabelFilter, LogEvent, LogLevel};

use crate::config::{Config, parse_label};

/// Dockscope - real-time logs, events and stats from container hosts
#[derive(Parser, Debug)]
#[command(name = "dockscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ./dockscope.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only include containers carrying this label (repeatable)
    #[arg(long = "label", global = true, value_name = "KEY=VALUE", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Restrict to one configured host
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List containers on every host
    Ps,

    /// Stream logs of one or more containers
    Logs {
        /// Container IDs (full or short) or names
        #[arg(required = true)]
        ids: Vec<String>,

        /// Number of historical lines per container
        #[arg(long)]
        tail: Option<usize>,

        /// Only lines newer than this RFC 3339 timestamp
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,

        /// Only lines matching this regex
        #[arg(long)]
        grep: Option<String>,

        /// Only structured lines whose field matches a regex, as KEY=PATTERN (repeatable)
        #[arg(long = "field", value_name = "KEY=PATTERN", value_parser = parse_label)]
        fields: Vec<(String, String)>,

        /// Case-insensitive --grep and --field
        #[arg(short = 'i', long)]
        ignore_case: bool,

        /// Print lines that do not match --grep and --field
        #[arg(short = 'v', long)]
        invert_match: bool,

        /// Only lines at these levels (repeatable)
        #[arg(long = "level")]
        levels: Vec<String>,

        /// Only the stdout stream
        #[arg(long, conflicts_with = "stderr")]
        stdout: bool,

        /// Only the stderr stream
        #[arg(long)]
        stderr: bool,
    },

    /// Stream container lifecycle events
    Events,

    /// Stream CPU and memory samples of running containers
    Stats,
}

/// One connected host
struct Connection {
    client: Arc<dyn ContainerClient>,
    store: ContainerStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let connections = connect(&config, &args).await?;

    let result = match args.command {
        Command::Ps => ps(&connections).await,
        Command::Logs {
            ids,
            tail,
            since,
            follow,
            grep,
            fields,
            ignore_case,
            invert_match,
            levels,
            stdout,
            stderr,
        } => {
            let search = Search {
                grep: grep.as_deref(),
                fields: &fields,
                ignore_case,
                invert: invert_match,
                levels: &levels,
            };
            let filter = search.build()?;
            let options = LogOptions {
                follow,
                since,
                tail: Some(tail.unwrap_or(config.logs.tail)),
                std_types: StdTypes {
                    stdout: !stderr,
                    stderr: !stdout,
                },
            };
            logs(&connections, &config, &ids, &options, &filter).await
        }
        Command::Events => events(&connections).await,
        Command::Stats => stats(&connections).await,
    };

    for connection in &connections {
        connection.store.shutdown();
    }
    result
}

async fn connect(config: &Config, args: &Args) -> Result<Vec<Connection>> {
    let hosts: Vec<_> = config
        .hosts()
        .into_iter()
        .filter(|h| args.host.as_ref().is_none_or(|name| &h.name == name))
        .collect();
    if hosts.is_empty() {
        bail!("no configured host named {}", args.host.as_deref().unwrap_or_default());
    }

    let store_config = config.store_config(&args.labels);
    let mut connections = Vec::with_capacity(hosts.len());
    for host in hosts {
        let client = DockerClient::connect(&host.name, host.endpoint.as_deref())
            .await
            .with_context(|| format!("failed to connect to host {}", host.name))?;
        let client: Arc<dyn ContainerClient> = Arc::new(client);
        let store = ContainerStore::new(Arc::clone(&client), store_config.clone()).await;
        connections.push(Connection { client, store });
    }
    Ok(connections)
}

/// Search flags of the `logs` command
struct Search<'a> {
    grep: Option<&'a str>,
    fields: &'a [(String, String)],
    ignore_case: bool,
    invert: bool,
    levels: &'a [String],
}

impl Search<'_> {
    fn build(&self) -> Result<LogFilter> {
        let mut filter = LogFilter::new();
        if self.ignore_case {
            filter = filter.ignore_case();
        }
        filter = filter.text(self.grep.unwrap_or_default())?;
        for (key, pattern) in self.fields {
            filter = filter.field(key, pattern)?;
        }
        if self.invert {
            filter = filter.inverted();
        }

        let mut wanted = HashSet::new();
        for name in self.levels {
            match LogLevel::from_alias(name) {
                LogLevel::Unknown => bail!("unknown log level '{name}'"),
                level => {
                    wanted.insert(level);
                }
            }
        }
        Ok(filter.with_levels(wanted))
    }
}

fn parse_since(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

/// Write one value as a JSON line on stdout
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

async fn ps(connections: &[Connection]) -> Result<()> {
    for connection in connections {
        let containers = connection
            .store
            .list_containers(&LabelFilter::new())
            .await
            .with_context(|| format!("failed to list containers on {}", connection.store.host().name))?;
        for container in containers {
            print_json(&container)?;
        }
    }
    Ok(())
}

async fn logs(
    connections: &[Connection],
    config: &Config,
    ids: &[String],
    options: &LogOptions,
    filter: &LogFilter,
) -> Result<()> {
    let levels = Arc::new(LevelClassifier::new().context("failed to build level rules")?);
    let mut manager = LogStreamManager::new(LogParser::new(levels), config.generator_config());
    let (tx, mut rx) = mpsc::channel::<LogEvent>(config.logs.buffer_size.max(1));

    for id in ids {
        let mut found = false;
        for connection in connections {
            if let Ok(container) = connection.store.resolve(id).await {
                manager.start_streams(Arc::clone(&connection.client), &[container], tx.clone(), options);
                found = true;
                break;
            }
        }
        if !found {
            bail!("container {id} not found");
        }
    }
    drop(tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if filter.matches(&event) {
                    print_json(&event)?;
                }
            }
        }
    }

    manager.stop();
    Ok(())
}

async fn events(connections: &[Connection]) -> Result<()> {
    let done = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);
    for connection in connections {
        let mut events = connection.store.subscribe_events(done.clone());
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let result: Result<()> = async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                event = rx.recv() => match event {
                    Some(event) => print_json(&event)?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    done.cancel();
    result
}

async fn stats(connections: &[Connection]) -> Result<()> {
    let done = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut guards = Vec::with_capacity(connections.len());
    for connection in connections {
        let mut samples = connection.store.subscribe_stats(done.clone());
        guards.push(connection.store.stats().acquire());
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let result: Result<()> = async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                sample = rx.recv() => match sample {
                    Some(sample) => print_json(&sample)?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    done.cancel();
    drop(guards);
    result
}
