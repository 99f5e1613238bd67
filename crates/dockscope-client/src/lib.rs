//! Container runtime clients for dockscope
//!
//! The rest of dockscope only talks to a runtime through [`ContainerClient`].
//! Each backend provides one adapter; Docker Engine is the built-in one.

mod client;
mod docker;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ClientError, ContainerClient, LogOptions, LogStream, StdTypes};
pub use docker::{DockerClient, StatsSample, short_id};

// Re-export types that are used in our public API
pub use dockscope_types::{Container, ContainerEvent, ContainerStat, Host, LabelFilter};
