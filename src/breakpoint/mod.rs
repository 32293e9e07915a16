pub mod hardware;

pub use hardware::{Breakpoint, Error, Trigger, WATCH_LEN};
