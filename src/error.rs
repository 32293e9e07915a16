use nix::errno::Errno;
use thiserror::Error;

use std::io;
use std::path::PathBuf;

use crate::arch::Address;
use crate::breakpoint;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to parse `{0}` as an address")]
    Parse(String),
    #[error("failed to register hardware breakpoint at {0:#x}: {1}")]
    RegistrationFailed(Address, Errno),
    #[error("failed to load: {0}")]
    Startup(#[source] Box<Error>),
    #[error("watchpoint manager has been shut down")]
    Closed,
    #[error(transparent)]
    Breakpoint(#[from] breakpoint::Error),
    #[error("could not parse configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("i/o failure on {}: {1}", _0.display())]
    Io(PathBuf, io::Error),
    #[error("control request failed: {0}")]
    Control(String),
}

impl Error {
    /// The hardware-layer error code behind a failed registration, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::RegistrationFailed(_, errno) => Some(*errno),
            Self::Startup(inner) => inner.errno(),
            _ => None,
        }
    }
}
