#![allow(non_upper_case_globals)]

use crate::breakpoint::{self, Trigger};

/// A watched memory address. Always 64 bits wide regardless of the host.
pub type Address = u64;

pub const HW_BREAKPOINT_R: u32 = 1;
pub const HW_BREAKPOINT_W: u32 = 2;

pub const HW_BREAKPOINT_LEN_1: u64 = 1;
pub const HW_BREAKPOINT_LEN_2: u64 = 2;
pub const HW_BREAKPOINT_LEN_4: u64 = 4;
pub const HW_BREAKPOINT_LEN_8: u64 = 8;

#[cfg(target_arch = "x86_64")]
pub const KERNEL_BASE: Address = 0xffff_8000_0000_0000;
#[cfg(not(target_arch = "x86_64"))]
pub const KERNEL_BASE: Address = 0xffff_0000_0000_0000;

pub fn is_kernel_address(address: Address) -> bool {
    address >= KERNEL_BASE
}

// Data watches only, following the x86 debug register rules: a read-only
// watch cannot be expressed, reads are always reported with writes.
pub(crate) fn breakpoint_type(trigger: Trigger) -> Result<u32, breakpoint::Error> {
    if trigger == Trigger::Read | Trigger::Write {
        Ok(HW_BREAKPOINT_R | HW_BREAKPOINT_W)
    } else if trigger == Trigger::Write {
        Ok(HW_BREAKPOINT_W)
    } else {
        Err(breakpoint::Error::InvalidTrigger(trigger))
    }
}

pub(crate) fn breakpoint_len_field(size: usize) -> Result<u64, breakpoint::Error> {
    match size {
        1 => Ok(HW_BREAKPOINT_LEN_1),
        2 => Ok(HW_BREAKPOINT_LEN_2),
        4 => Ok(HW_BREAKPOINT_LEN_4),
        #[cfg(target_pointer_width = "64")]
        8 => Ok(HW_BREAKPOINT_LEN_8),
        _ => Err(breakpoint::Error::InvalidSize(size)),
    }
}
