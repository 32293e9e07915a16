//! Traffic generator for exercising a watch: bumps a 4-byte value at a
//! fixed heap address on every tick and logs where it lives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::arch::Address;
use crate::event::{Hex, COMPONENT};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

pub struct Workload {
    value: Arc<AtomicU32>,
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

impl Workload {
    pub fn start(interval: Duration) -> std::io::Result<Self> {
        let value = Arc::new(AtomicU32::new(0));
        let (stop, stopped) = mpsc::channel();

        let shared = value.clone();
        let worker = thread::Builder::new()
            .name("mwatch-workload".to_owned())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let current = shared.fetch_add(1, Ordering::SeqCst) + 1;
                        let address = Hex(&*shared as *const AtomicU32 as Address);
                        tracing::info!(component = COMPONENT, "value incremented. value = {}", current);
                        tracing::info!(component = COMPONENT, "value address: {}", address);
                    }
                    _ => break,
                }
            })?;

        let workload = Self {
            value,
            stop,
            worker,
        };
        tracing::info!(
            component = COMPONENT,
            "workload started; value address: {}",
            Hex(workload.address())
        );
        Ok(workload)
    }

    /// Address of the mutated value; stable for the life of the workload.
    pub fn address(&self) -> Address {
        &*self.value as *const AtomicU32 as Address
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn stop(self) {
        self.stop.send(()).ok();
        if self.worker.join().is_err() {
            tracing::error!("workload thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn increments_until_stopped() {
        let workload = Workload::start(Duration::from_millis(5)).unwrap();
        let address = workload.address();

        let deadline = Instant::now() + Duration::from_secs(5);
        while workload.value() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(workload.value() >= 3);
        assert_eq!(workload.address(), address);
        assert_eq!(address % 4, 0);
        workload.stop();
    }
}
