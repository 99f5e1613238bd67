//! Container state for dockscope
//!
//! A concurrent, event-synchronized cache of the containers on a host, with
//! fan-out subscriptions for lifecycle events, new containers and resource stats.

mod error;
mod stats;
mod store;
mod subscribers;

pub use error::StoreError;
pub use stats::{StatsCollector, StatsConfig, StatsGuard};
pub use store::{ContainerStore, StoreConfig};
pub use subscribers::SubscriberRegistry;
