use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

enum State<T> {
	Pending(Vec<Box<dyn FnOnce(T)>>),
	Fired(T),
}

/// A value that becomes available later, exactly once.
///
/// Returned by asynchronous operations such as `stop_listening` and
/// multicast `join_group`. Callbacks added after the value arrived run
/// immediately. Clones share the same slot.
pub struct Deferred<T: Clone + 'static> {
	state: Rc<RefCell<State<T>>>,
}

impl<T: Clone + 'static> Deferred<T> {
	pub fn new() -> Self {
		Self {
			state: Rc::new(RefCell::new(State::Pending(Vec::new()))),
		}
	}

	/// An already completed deferred.
	pub fn fired(value: T) -> Self {
		Self {
			state: Rc::new(RefCell::new(State::Fired(value))),
		}
	}

	pub fn is_fired(&self) -> bool {
		matches!(*self.state.borrow(), State::Fired(_))
	}

	/// The value, once available.
	pub fn result(&self) -> Option<T> {
		match &*self.state.borrow() {
			State::Fired(value) => Some(value.clone()),
			State::Pending(_) => None,
		}
	}

	pub fn add_callback(&self, f: impl FnOnce(T) + 'static) {
		let value = {
			let mut state = self.state.borrow_mut();
			match &mut *state {
				State::Pending(callbacks) => {
					callbacks.push(Box::new(f));
					return;
				}
				State::Fired(value) => value.clone(),
			}
		};
		f(value);
	}

	/// Completes the deferred. A second call is ignored.
	pub(crate) fn fire(&self, value: T) {
		let callbacks = {
			let mut state = self.state.borrow_mut();
			match std::mem::replace(&mut *state, State::Fired(value.clone())) {
				State::Pending(callbacks) => callbacks,
				fired @ State::Fired(_) => {
					*state = fired;
					return;
				}
			}
		};
		for callback in callbacks {
			callback(value.clone());
		}
	}
}

impl<T: Clone + 'static> Clone for Deferred<T> {
	fn clone(&self) -> Self {
		Self {
			state: Rc::clone(&self.state),
		}
	}
}

impl<T: Clone + 'static> Default for Deferred<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + 'static> fmt::Debug for Deferred<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Deferred").field("fired", &self.is_fired()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::Cell;

	#[test]
	fn callbacks_run_once_in_order() {
		let d = Deferred::new();
		let seen = Rc::new(RefCell::new(Vec::new()));
		for tag in 0..3 {
			let seen = seen.clone();
			d.add_callback(move |v: u32| seen.borrow_mut().push((tag, v)));
		}
		d.fire(7);
		d.fire(8);
		assert_eq!(*seen.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
		assert_eq!(d.result(), Some(7));
	}

	#[test]
	fn late_callback_runs_immediately() {
		let d = Deferred::fired(());
		let hit = Rc::new(Cell::new(false));
		let h = hit.clone();
		d.add_callback(move |()| h.set(true));
		assert!(hit.get());
	}

	#[test]
	fn callback_may_chain_on_same_deferred() {
		let d: Deferred<u8> = Deferred::new();
		let count = Rc::new(Cell::new(0));
		let (d2, c) = (d.clone(), count.clone());
		d.add_callback(move |_| {
			let c = c.clone();
			d2.add_callback(move |_| c.set(c.get() + 1));
		});
		d.fire(1);
		assert_eq!(count.get(), 1);
	}
}
