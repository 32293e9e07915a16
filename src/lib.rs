pub mod arch;
pub mod backend;
pub mod breakpoint;
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod handler;
pub mod manager;
pub mod param;
pub mod perf;
pub mod watcher;
pub mod workload;
mod util;

#[cfg(test)]
mod test_utils;

pub use nix::errno::Errno;

pub use arch::Address;
pub use backend::Backend;
pub use breakpoint::Breakpoint;
pub use capture::{Callchain, Capture};
pub use config::{Config, WatchConfig};
pub use error::Error;
pub use event::{Event, EventSink, TracingSink};
pub use handler::{Trigger, TriggerHandler};
pub use manager::{Manager, Status};
pub use param::{parse_address, Param};
pub use perf::{PerfBackend, PerfHandle};
pub use watcher::Watcher;
pub use workload::Workload;
