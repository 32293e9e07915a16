use nix::errno::Errno;

use std::sync::Arc;

use crate::breakpoint::Breakpoint;
use crate::handler::TriggerHandler;

/// The hardware layer: grants and releases the exclusive breakpoint resource.
///
/// A handle is consumed by `unregister`, so releasing one twice does not
/// type-check; whether a handle exists at all is tracked by the manager.
pub trait Backend: Send + 'static {
    type Handle: Send + 'static;

    /// Registers `breakpoint` on every processor in scope. Either all of them
    /// accept or none remain registered.
    fn register(
        &mut self,
        breakpoint: &Breakpoint,
        handler: Arc<TriggerHandler>,
    ) -> Result<Self::Handle, Errno>;

    /// False once the registration behind `handle` has stopped delivering
    /// triggers by itself. The handle must still be passed to `unregister`.
    fn is_live(&self, handle: &Self::Handle) -> bool;

    /// Releases the handle. Once this returns the handler is not invoked again.
    fn unregister(&mut self, handle: Self::Handle);
}
