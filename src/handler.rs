use nix::errno::Errno;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arch::Address;
use crate::capture::Capture;
use crate::event::{Event, EventSink};

/// One qualifying access, as reported by the hardware layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    pub cpu: u32,
    pub pid: u32,
    pub tid: u32,
    pub ip: u64,
    pub addr: Address,
    pub callchain: Vec<u64>,
}

/// Invoked from the dispatcher context once per access. Never blocks on the
/// manager and has no way to reach it.
pub struct TriggerHandler {
    address: Arc<AtomicU64>,
    capture: Arc<dyn Capture>,
    events: Arc<dyn EventSink>,
}

impl TriggerHandler {
    pub fn new(
        address: Arc<AtomicU64>,
        capture: Arc<dyn Capture>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            address,
            capture,
            events,
        }
    }

    pub fn fire(&self, trigger: &Trigger) {
        // the configured address, which may already be newer than the one
        // that actually fired
        let address = self.address.load(Ordering::Acquire);

        self.events.emit(&Event::TriggerFired { address });
        self.capture.capture(trigger);
        self.events.emit(&Event::TriggerCompleted { address });
    }

    /// Reports that the hardware layer stopped delivering triggers for the
    /// current registration.
    pub fn fault(&self, errno: Errno) {
        let address = self.address.load(Ordering::Acquire);
        self.events.emit(&Event::DeliveryFailed { address, errno });
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::capture::MockCapture;
    use crate::test_utils::RecordingSink;

    #[test]
    fn fire_brackets_a_single_capture() {
        let trigger = Trigger {
            cpu: 1,
            pid: 42,
            tid: 42,
            ip: 0x401000,
            addr: 0x3000,
            callchain: vec![0x401000, 0x402000],
        };

        let mut capture = MockCapture::new();
        capture
            .expect_capture()
            .with(eq(trigger.clone()))
            .times(1)
            .return_const(());

        let events = Arc::new(RecordingSink::default());
        let handler = TriggerHandler::new(
            Arc::new(AtomicU64::new(0x3000)),
            Arc::new(capture),
            events.clone(),
        );

        handler.fire(&trigger);

        assert_eq!(
            events.take(),
            vec![
                Event::TriggerFired { address: 0x3000 },
                Event::TriggerCompleted { address: 0x3000 },
            ]
        );
    }

    #[test]
    fn fault_is_reported_without_capture() {
        let mut capture = MockCapture::new();
        capture.expect_capture().times(0);

        let events = Arc::new(RecordingSink::default());
        let handler = TriggerHandler::new(
            Arc::new(AtomicU64::new(0x3000)),
            Arc::new(capture),
            events.clone(),
        );

        handler.fault(Errno::EBADF);

        let seen = events.take();
        assert_eq!(
            seen,
            vec![Event::DeliveryFailed {
                address: 0x3000,
                errno: Errno::EBADF,
            }]
        );
        assert!(seen[0].is_failure());
    }

    #[test]
    fn fire_reports_the_currently_configured_address() {
        let address = Arc::new(AtomicU64::new(0x1000));
        let mut capture = MockCapture::new();
        capture.expect_capture().times(1).return_const(());

        let events = Arc::new(RecordingSink::default());
        let handler = TriggerHandler::new(address.clone(), Arc::new(capture), events.clone());

        address.store(0x2000, Ordering::Release);
        handler.fire(&Trigger::default());

        assert_eq!(events.take()[0], Event::TriggerFired { address: 0x2000 });
    }
}
