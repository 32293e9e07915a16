//! The audit trail: every state transition and trigger firing becomes an
//! [`Event`] handed to an [`EventSink`].

use nix::errno::Errno;

use std::fmt;

use crate::arch::Address;

pub const COMPONENT: &str = "mwatch";

/// Formats an address as `0x…`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex(pub Address);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Load { address: Address },
    Loaded { address: Address },
    LoadFailed { address: Address },
    Unload { address: Address },
    ParamRead { address: Address },
    ParamWrite { address: Address },
    Unregistered { address: Address },
    RegistrationSuccess { address: Address },
    RegistrationFailure { address: Address, errno: Errno },
    TriggerFired { address: Address },
    TriggerCompleted { address: Address },
    DeliveryFailed { address: Address, errno: Errno },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Loaded { .. } => "loaded",
            Self::LoadFailed { .. } => "load-failed",
            Self::Unload { .. } => "unload",
            Self::ParamRead { .. } => "parameter-read",
            Self::ParamWrite { .. } => "parameter-write",
            Self::Unregistered { .. } => "unregistered",
            Self::RegistrationSuccess { .. } => "registration-success",
            Self::RegistrationFailure { .. } => "registration-failure",
            Self::TriggerFired { .. } => "trigger-fired",
            Self::TriggerCompleted { .. } => "trigger-completed",
            Self::DeliveryFailed { .. } => "delivery-failed",
        }
    }

    pub fn address(&self) -> Address {
        match *self {
            Self::Load { address }
            | Self::Loaded { address }
            | Self::LoadFailed { address }
            | Self::Unload { address }
            | Self::ParamRead { address }
            | Self::ParamWrite { address }
            | Self::Unregistered { address }
            | Self::RegistrationSuccess { address }
            | Self::RegistrationFailure { address, .. }
            | Self::TriggerFired { address }
            | Self::TriggerCompleted { address }
            | Self::DeliveryFailed { address, .. } => address,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::LoadFailed { .. } | Self::RegistrationFailure { .. } | Self::DeliveryFailed { .. }
        )
    }

    /// True for events that reflect a change of hardware registration.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::Unregistered { .. }
                | Self::RegistrationSuccess { .. }
                | Self::RegistrationFailure { .. }
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = Hex(self.address());
        match self {
            Self::Load { .. } => write!(f, "loading with default address ({})", address),
            Self::Loaded { .. } => write!(f, "loaded, watching {}", address),
            Self::LoadFailed { .. } => write!(f, "failed to load at {}", address),
            Self::Unload { .. } => write!(f, "unloaded (last address {})", address),
            Self::ParamRead { .. } => write!(f, "address read: {}", address),
            Self::ParamWrite { .. } => write!(f, "address written: {}", address),
            Self::Unregistered { .. } => {
                write!(f, "hardware breakpoint at {} unregistered", address)
            }
            Self::RegistrationSuccess { .. } => {
                write!(f, "hardware breakpoint registered at address: {}", address)
            }
            Self::RegistrationFailure { errno, .. } => write!(
                f,
                "failed to register hardware breakpoint at {}: {}",
                address, errno
            ),
            Self::TriggerFired { .. } => {
                write!(f, "watchpoint triggered at address: {}", address)
            }
            Self::TriggerCompleted { .. } => write!(f, "end of call context for {}", address),
            Self::DeliveryFailed { errno, .. } => {
                write!(f, "trigger delivery for {} stopped: {}", address, errno)
            }
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        let addr = Hex(event.address());
        if event.is_failure() {
            tracing::error!(component = COMPONENT, event = event.kind(), addr = %addr, "{}", event);
        } else {
            tracing::info!(component = COMPONENT, event = event.kind(), addr = %addr, "{}", event);
        }
    }
}
