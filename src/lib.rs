//! Measures the cycle cost of a basic block by running it, unrolled and
//! looped, inside a traced subject process with a hardware counter bound
//! around the loop.

pub mod arch;
pub mod arena;
pub mod config;
pub mod counter;
pub mod error;
pub mod events;
pub mod injector;
pub mod input;
pub mod orchestrator;
pub mod recovery;
pub mod relocator;
pub mod subject;

pub use config::HarnessConfig;
pub use error::{BlockLimits, HarnessError, Result};
pub use events::{EventSink, HarnessEvent, MetricsSink, NullSink, RecordingSink, TracingSink};
pub use orchestrator::{measure, Harness, Measurement};
