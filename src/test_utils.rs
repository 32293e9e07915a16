//! Fakes for the hardware layer, the event stream and the capture facility.

use nix::errno::Errno;
use parking_lot::Mutex;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::Backend;
use crate::breakpoint::Breakpoint;
use crate::capture::Capture;
use crate::event::{Event, EventSink};
use crate::handler::{Trigger, TriggerHandler};
use crate::manager::Manager;

#[derive(Default)]
struct FakeState {
    live: Vec<u64>,
    dead: Vec<u64>,
    peak: usize,
    next_id: u64,
    registrations: usize,
    unregistrations: usize,
    fail_next: Option<Errno>,
    last: Option<Breakpoint>,
    handler: Option<Arc<TriggerHandler>>,
}

/// A hardware layer that refuses to hand out a second handle while one is
/// live and panics on a double release.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
pub struct FakeHandle {
    id: u64,
}

impl FakeBackend {
    pub fn fail_next(&self, errno: Errno) {
        self.state.lock().fail_next = Some(errno);
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn peak_live(&self) -> usize {
        self.state.lock().peak
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    pub fn unregistrations(&self) -> usize {
        self.state.lock().unregistrations
    }

    pub fn last_breakpoint(&self) -> Option<Breakpoint> {
        self.state.lock().last
    }

    /// Simulates the hardware layer losing the live registration on its own.
    pub fn stop_delivery(&self) {
        let mut state = self.state.lock();
        let live = state.live.clone();
        state.dead.extend(live);
    }

    /// Simulates the hardware reporting an access.
    pub fn fire(&self, trigger: &Trigger) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler.fire(trigger);
        }
    }
}

impl Backend for FakeBackend {
    type Handle = FakeHandle;

    fn register(
        &mut self,
        breakpoint: &Breakpoint,
        handler: Arc<TriggerHandler>,
    ) -> Result<FakeHandle, Errno> {
        let mut state = self.state.lock();
        if let Some(errno) = state.fail_next.take() {
            return Err(errno);
        }

        assert!(state.live.is_empty(), "slot already taken by {:?}", state.live);

        let id = state.next_id;
        state.next_id += 1;
        state.live.push(id);
        state.peak = state.peak.max(state.live.len());
        state.registrations += 1;
        state.last = Some(*breakpoint);
        state.handler = Some(handler);

        Ok(FakeHandle { id })
    }

    fn is_live(&self, handle: &FakeHandle) -> bool {
        !self.state.lock().dead.contains(&handle.id)
    }

    fn unregister(&mut self, handle: FakeHandle) {
        let mut state = self.state.lock();
        let slot = state
            .live
            .iter()
            .position(|&id| id == handle.id)
            .unwrap_or_else(|| panic!("handle {} released twice", handle.id));

        state.live.remove(slot);
        state.unregistrations += 1;
        state.handler = None;
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &Event) {
        self.events.lock().push(*event);
    }
}

#[derive(Default)]
pub struct CountingCapture {
    count: AtomicUsize,
}

impl CountingCapture {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Capture for CountingCapture {
    fn capture(&self, _trigger: &Trigger) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn manager(backend: &FakeBackend, events: &Arc<RecordingSink>) -> Arc<Manager<FakeBackend>> {
    Arc::new(Manager::new(
        backend.clone(),
        Arc::new(CountingCapture::default()),
        events.clone(),
    ))
}
