//! The event-loop capability every transport is handed at construction.
//!
//! The crate never implements a loop itself. Anything that can multiplex
//! readiness, run timers and resolve names can drive the transports by
//! implementing [`Reactor`].

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::error::CloseReason;

/// Something with a descriptor the reactor can watch.
///
/// A reactor must keep the `Rc` it was given for as long as the source is
/// registered, and must hold a strong reference while calling into it.
pub trait Selectable {
	/// Descriptor being watched, `-1` once closed.
	fn fileno(&self) -> RawFd;

	/// The descriptor is readable.
	fn do_read(&self);

	/// The descriptor is writable.
	fn do_write(&self);

	/// The reactor gave up on this source (for example the loop is shutting
	/// down). The source tears itself down with `reason`.
	fn connection_lost(&self, reason: CloseReason);

	/// Tag used in log lines about this source.
	fn log_prefix(&self) -> String {
		String::from("-")
	}
}

/// Token returned by [`Reactor::call_later`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayedCall(u64);

impl DelayedCall {
	pub fn new(id: u64) -> Self {
		Self(id)
	}

	pub fn id(&self) -> u64 {
		self.0
	}
}

/// Result of a name lookup. `None` means the name did not resolve.
pub type ResolveCallback = Box<dyn FnOnce(Option<IpAddr>)>;

/// Readiness multiplexing, timers and name resolution.
///
/// `add_*` calls for an already registered source and `remove_*` calls for
/// an unregistered descriptor are no-ops.
pub trait Reactor {
	fn add_reader(&self, source: Rc<dyn Selectable>);
	fn add_writer(&self, source: Rc<dyn Selectable>);
	fn remove_reader(&self, fd: RawFd);
	fn remove_writer(&self, fd: RawFd);

	/// Runs `f` once after `delay`. A zero delay means "on the next turn",
	/// never synchronously.
	fn call_later(&self, delay: Duration, f: Box<dyn FnOnce()>) -> DelayedCall;

	/// Cancels a pending call. Cancelling a call that already ran is a no-op.
	fn cancel_call(&self, call: DelayedCall);

	/// Resolves `name` to one address, delivering the answer later.
	fn resolve(&self, name: &str, done: ResolveCallback);
}

pub(crate) fn call_soon(reactor: &Rc<dyn Reactor>, f: impl FnOnce() + 'static) -> DelayedCall {
	reactor.call_later(Duration::ZERO, Box::new(f))
}
