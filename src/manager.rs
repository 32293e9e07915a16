//! The watchpoint lifecycle state machine.
//!
//! All transitions of the single hardware breakpoint go through one mutex.
//! The manager's own bookkeeping is the only record of whether a handle is
//! live, since the hardware layer cannot be asked cheaply.

use parking_lot::Mutex;

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arch::Address;
use crate::backend::Backend;
use crate::breakpoint::Breakpoint;
use crate::capture::Capture;
use crate::error::Error;
use crate::event::{Event, EventSink};
use crate::handler::TriggerHandler;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Unregistered,
    Registered(Address),
}

impl Default for Status {
    fn default() -> Self {
        Self::Unregistered
    }
}

enum State<H> {
    Unregistered,
    Registered { handle: H, address: Address },
}

struct Inner<B: Backend> {
    backend: B,
    state: State<B::Handle>,
    closed: bool,
}

impl<B: Backend> Inner<B> {
    fn teardown(&mut self, events: &dyn EventSink) {
        if let State::Registered { handle, address } =
            mem::replace(&mut self.state, State::Unregistered)
        {
            self.backend.unregister(handle);
            events.emit(&Event::Unregistered { address });
        }
    }

    /// Releases a registration the backend has stopped delivering for, so
    /// the recorded state matches the hardware again.
    fn reap(&mut self, events: &dyn EventSink) {
        let dead = match &self.state {
            State::Registered { handle, .. } => !self.backend.is_live(handle),
            State::Unregistered => false,
        };
        if dead {
            tracing::warn!("hardware layer dropped the watch; releasing it");
            self.teardown(events);
        }
    }
}

pub struct Manager<B: Backend> {
    inner: Mutex<Inner<B>>,
    address: Arc<AtomicU64>,
    handler: Arc<TriggerHandler>,
    events: Arc<dyn EventSink>,
}

impl<B: Backend> Manager<B> {
    pub fn new(backend: B, capture: Arc<dyn Capture>, events: Arc<dyn EventSink>) -> Self {
        let address = Arc::new(AtomicU64::new(0));
        let handler = Arc::new(TriggerHandler::new(
            address.clone(),
            capture,
            events.clone(),
        ));

        Self {
            inner: Mutex::new(Inner {
                backend,
                state: State::Unregistered,
                closed: false,
            }),
            address,
            handler,
            events,
        }
    }

    /// Watches `address` for 4-byte reads and writes.
    ///
    /// Any live registration is released first, even when it already covers
    /// `address`. If the new registration is refused the manager stays
    /// unregistered; the previous address is not restored.
    pub fn configure(&self, address: Address) -> Result<(), Error> {
        let breakpoint = Breakpoint::watch(address)?;

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        inner.teardown(&*self.events);
        self.address.store(address, Ordering::Release);

        match inner.backend.register(&breakpoint, self.handler.clone()) {
            Ok(handle) => {
                inner.state = State::Registered { handle, address };
                self.events.emit(&Event::RegistrationSuccess { address });
                Ok(())
            }
            Err(errno) => {
                self.events
                    .emit(&Event::RegistrationFailure { address, errno });
                Err(Error::RegistrationFailed(address, errno))
            }
        }
    }

    /// Releases the live registration, if any. Safe to repeat.
    pub fn teardown(&self) {
        self.inner.lock().teardown(&*self.events);
    }

    /// Tears down and refuses all further configuration.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.teardown(&*self.events);
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current registration. A registration the hardware layer has given up
    /// on is released here and reported as unregistered.
    pub fn status(&self) -> Status {
        let mut inner = self.inner.lock();
        inner.reap(&*self.events);
        match inner.state {
            State::Unregistered => Status::Unregistered,
            State::Registered { address, .. } => Status::Registered(address),
        }
    }

    /// The most recently configured address, whether or not its
    /// registration succeeded.
    pub fn address(&self) -> Address {
        self.address.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }
}
