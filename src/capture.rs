//! Call-context capture invoked from the trigger path.

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use procmaps::{Mappings, Path};

use std::sync::Arc;

use crate::arch::{self, Address};
use crate::event::{Hex, COMPONENT};
use crate::handler::Trigger;

#[cfg_attr(test, automock)]
pub trait Capture: Send + Sync {
    /// Produce and emit a description of the context that fired the trigger.
    fn capture(&self, trigger: &Trigger);
}

/// Emits the sampled callchain, one frame per line, with user frames
/// resolved to `module+offset` through the target's memory map.
///
/// The map of the last sampled process is kept and only re-read when the
/// pid changes or a user frame falls outside every known mapping.
#[derive(Default)]
pub struct Callchain {
    cache: Mutex<Option<(u32, Arc<Mappings>)>>,
}

impl Callchain {
    fn mappings(&self, pid: u32, refresh: bool) -> Option<Arc<Mappings>> {
        let mut cache = self.cache.lock();
        if let Some((cached, mappings)) = &*cache {
            if *cached == pid && !refresh {
                return Some(mappings.clone());
            }
        }

        let mappings = Arc::new(Mappings::from_pid(pid as _).ok()?);
        *cache = Some((pid, mappings.clone()));
        Some(mappings)
    }
}

impl Capture for Callchain {
    fn capture(&self, trigger: &Trigger) {
        let mut mappings = self.mappings(trigger.pid, false);
        let stale = frames(trigger).any(|ip| {
            !arch::is_kernel_address(ip) && !mappings.as_deref().map_or(false, |m| covers(m, ip))
        });
        if stale {
            mappings = self.mappings(trigger.pid, true).or(mappings);
        }

        tracing::info!(
            component = COMPONENT,
            cpu = trigger.cpu,
            pid = trigger.pid,
            tid = trigger.tid,
            data = %Hex(trigger.addr),
            "dumping call context:"
        );

        for (n, ip) in frames(trigger).enumerate() {
            tracing::info!(
                component = COMPONENT,
                "#{:<2} {:#018x} {}",
                n,
                ip,
                describe(ip, mappings.as_deref())
            );
        }
    }
}

fn frames(trigger: &Trigger) -> impl Iterator<Item = u64> + '_ {
    let fallback = if trigger.callchain.is_empty() {
        Some(trigger.ip)
    } else {
        None
    };
    trigger.callchain.iter().copied().chain(fallback)
}

fn covers(mappings: &Mappings, ip: Address) -> bool {
    mappings
        .iter()
        .any(|m| (m.base as Address) <= ip && ip < (m.ceiling as Address))
}

fn describe(ip: Address, mappings: Option<&Mappings>) -> String {
    if arch::is_kernel_address(ip) {
        return "[kernel]".to_owned();
    }

    let map = mappings.and_then(|maps| {
        maps.iter()
            .find(|m| (m.base as Address) <= ip && ip < (m.ceiling as Address))
    });

    match map {
        Some(map) => {
            let offset = ip - map.base as Address + map.offset as Address;
            match &map.pathname {
                Path::MappedFile(file) => format!("{}+{:#x}", file, offset),
                _ => format!("[anon]+{:#x}", ip - map.base as Address),
            }
        }
        None => "[unknown]".to_owned(),
    }
}
