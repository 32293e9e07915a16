use nix::unistd::getuid;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::Address;
use crate::error::Error;
use crate::param::parse_address;

pub const DEFAULT_ADDRESS: Address = 0x0;
pub const DEFAULT_BUFFER_PAGES: usize = 8;
pub const DEFAULT_LOG: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_address")]
    pub address: Address,
    pub socket: PathBuf,
    pub log: String,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Process to watch; system-wide when absent.
    pub pid: Option<i32>,
    pub exclude_kernel: bool,
    /// Ring buffer data pages per processor; a power of two.
    pub buffer_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            socket: default_socket(),
            log: DEFAULT_LOG.to_owned(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            pid: None,
            exclude_kernel: true,
            buffer_pages: DEFAULT_BUFFER_PAGES,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::Io(path.to_owned(), e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.watch.buffer_pages.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "buffer_pages must be a power of two, got {}",
                self.watch.buffer_pages
            )));
        }

        if matches!(self.watch.pid, Some(pid) if pid <= 0) {
            return Err(Error::InvalidConfig(format!(
                "pid must be positive, got {}",
                self.watch.pid.unwrap_or_default()
            )));
        }

        if self.socket.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("socket path is empty".to_owned()));
        }

        Ok(())
    }
}

/// `$XDG_RUNTIME_DIR/mwatch.sock`, or a per-user path under `/tmp`.
pub fn default_socket() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("mwatch.sock"),
        _ => PathBuf::from(format!("/tmp/mwatch-{}.sock", getuid())),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressRepr {
    Number(u64),
    Text(String),
}

fn deserialize_address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
    match AddressRepr::deserialize(deserializer)? {
        AddressRepr::Number(address) => Ok(address),
        AddressRepr::Text(text) => parse_address(&text).map_err(D::Error::custom),
    }
}
