//! Log processing for dockscope
//!
//! This crate turns raw container output into grouped, leveled log events:
//! frame decoding, parsing, level detection, multi-line grouping, filtering
//! and per-container streaming.

mod filter;
mod frame;
mod generator;
mod grouper;
mod level;
mod logfmt;
mod parser;
mod stream;

pub use filter::{FilterError, LogFilter};
pub use frame::{Frame, FrameError, FrameReader};
pub use generator::{EventGenerator, GeneratorConfig};
pub use grouper::{Grouper, Record};
pub use level::LevelClassifier;
pub use logfmt::{LogfmtError, parse_logfmt};
pub use parser::{LogParser, fnv1a32, parse_raw};
pub use stream::LogStreamManager;

// Re-export types used in our public API
pub use dockscope_types::{LogEvent, LogLevel, LogMessage, Position, StdType};
