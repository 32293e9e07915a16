use std::sync::Arc;

use crate::arch::Address;
use crate::backend::Backend;
use crate::capture::Capture;
use crate::error::Error;
use crate::event::{Event, EventSink};
use crate::manager::Manager;
use crate::param::Param;

/// Process-lifetime owner of the manager. Created by [`Watcher::init`];
/// teardown happens exactly once, through [`Watcher::exit`] or on drop.
pub struct Watcher<B: Backend> {
    manager: Arc<Manager<B>>,
    live: bool,
}

impl<B: Backend> Watcher<B> {
    /// Registers the initial watch. A refused registration fails the whole
    /// start; no watcher exists afterwards.
    pub fn init(
        backend: B,
        address: Address,
        capture: Arc<dyn Capture>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, Error> {
        events.emit(&Event::Load { address });

        let manager = Arc::new(Manager::new(backend, capture, events.clone()));
        if let Err(err) = manager.configure(address) {
            manager.shutdown();
            events.emit(&Event::LoadFailed { address });
            return Err(Error::Startup(Box::new(err)));
        }

        events.emit(&Event::Loaded { address });
        Ok(Self {
            manager,
            live: true,
        })
    }

    pub fn manager(&self) -> &Arc<Manager<B>> {
        &self.manager
    }

    pub fn param(&self) -> Param<B> {
        Param::new(self.manager.clone())
    }

    pub fn exit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;

        self.manager.shutdown();
        self.manager.events().emit(&Event::Unload {
            address: self.manager.address(),
        });
    }
}

impl<B: Backend> Drop for Watcher<B> {
    fn drop(&mut self) {
        self.release();
    }
}
