#![deny(clippy::all, clippy::perf, clippy::correctness, rust_2018_idioms)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::ptr_arg)]
#![warn(clippy::unnecessary_lazy_evaluations)]

pub mod aggregate;
pub mod error;
pub mod placement;
pub mod platform;
pub mod region;
pub mod settings;
pub mod test_helper;
pub mod topology;

pub use aggregate::{PerRadCounts, RadAggregator};
pub use error::{Error, Result};
pub use platform::{CpuId, CpuMask, CpuRadAssignment, CpuRadPair, Platform, RadId};
pub use topology::{TopologyCache, TOPOLOGY};
