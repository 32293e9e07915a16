#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use thiserror::Error;

use crate::arch::{self, Address};

/// Width of the watched region, in bytes.
pub const WATCH_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to watch using specified size {0}")]
    InvalidSize(usize),
    #[error("unable to watch using specified trigger {0:?}")]
    InvalidTrigger(Trigger),
}

bitflags! {
    pub struct Trigger: u32 {
        const Read = arch::HW_BREAKPOINT_R;
        const Write = arch::HW_BREAKPOINT_W;
    }
}

/// Description of a single hardware watch: where, how wide, and on which
/// kind of access. Carries no registration state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    address: Address,
    size: usize,
    trigger: Trigger,
    bp_type: u32,
    bp_len: u64,
}

impl Breakpoint {
    pub fn new(address: Address, size: usize, trigger: Trigger) -> Result<Self, Error> {
        let bp_type = arch::breakpoint_type(trigger)?;
        let bp_len = arch::breakpoint_len_field(size)?;

        Ok(Self {
            address,
            size,
            trigger,
            bp_type,
            bp_len,
        })
    }

    /// A read/write watch of `WATCH_LEN` bytes at `address`.
    pub fn watch(address: Address) -> Result<Self, Error> {
        Self::new(address, WATCH_LEN, Trigger::Read | Trigger::Write)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub(crate) fn bp_type(&self) -> u32 {
        self.bp_type
    }

    pub(crate) fn bp_len(&self) -> u64 {
        self.bp_len
    }
}
