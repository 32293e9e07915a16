//! The operator-facing read/write entry for the watched address.

use std::sync::Arc;

use crate::arch::Address;
use crate::backend::Backend;
use crate::error::Error;
use crate::event::{Event, Hex};
use crate::manager::Manager;

/// Parses an address with base auto-detection: `0x`/`0X` is hexadecimal, a
/// leading `0` is octal, anything else decimal. Surrounding whitespace
/// (including the trailing newline of a shell `echo`) is ignored.
pub fn parse_address(text: &str) -> Result<Address, Error> {
    let trimmed = text.trim();
    let (digits, radix) = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        (&trimmed[2..], 16)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') {
        (&trimmed[1..], 8)
    } else {
        (trimmed, 10)
    };

    // from_str_radix tolerates a sign; an address never has one
    if digits.starts_with('+') || digits.starts_with('-') {
        return Err(Error::Parse(trimmed.to_owned()));
    }

    Address::from_str_radix(digits, radix).map_err(|_| Error::Parse(trimmed.to_owned()))
}

pub struct Param<B: Backend> {
    manager: Arc<Manager<B>>,
}

impl<B: Backend> Clone for Param<B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<B: Backend> Param<B> {
    pub fn new(manager: Arc<Manager<B>>) -> Self {
        Self { manager }
    }

    /// Parses `text` and reconfigures the watchpoint. Malformed input is
    /// rejected before anything is stored or any hardware is touched.
    pub fn set(&self, text: &str) -> Result<(), Error> {
        let address = parse_address(text)?;
        self.manager.events().emit(&Event::ParamWrite { address });
        self.manager.configure(address)
    }

    pub fn get(&self) -> Address {
        let address = self.manager.address();
        self.manager.events().emit(&Event::ParamRead { address });
        address
    }

    pub fn show(&self) -> String {
        Hex(self.get()).to_string()
    }
}
