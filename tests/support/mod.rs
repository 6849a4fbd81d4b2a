//! A small poll(2) reactor with a virtual clock, plus recording protocols
//! shared by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use reactorlane::{
	Address, ClientFactory, CloseReason, ConnectError, ConnectorControl, DelayedCall, Factory, Protocol, Reactor,
	ResolveCallback, Selectable, Transport,
};

/// Readiness comes from `poll`, time only moves when a test says so.
#[derive(Default)]
pub struct TestReactor {
	readers: RefCell<HashMap<RawFd, Rc<dyn Selectable>>>,
	writers: RefCell<HashMap<RawFd, Rc<dyn Selectable>>>,
	timers: RefCell<BTreeMap<(Duration, u64), Box<dyn FnOnce()>>>,
	due: RefCell<HashMap<u64, Duration>>,
	now: Cell<Duration>,
	next_id: Cell<u64>,
	names: RefCell<HashMap<String, IpAddr>>,
	/// Names whose lookups never answer.
	held: RefCell<Vec<(String, Option<ResolveCallback>)>>,
	/// Registered descriptors poll reported as invalid.
	stale: Cell<usize>,
}

impl TestReactor {
	pub fn new() -> Rc<Self> {
		Rc::new(Self::default())
	}

	pub fn add_name(&self, name: &str, ip: IpAddr) {
		self.names.borrow_mut().insert(name.to_owned(), ip);
	}

	/// Lookups of `name` stay pending forever.
	pub fn hold_name(&self, name: &str) {
		self.held.borrow_mut().push((name.to_owned(), None));
	}

	pub fn now(&self) -> Duration {
		self.now.get()
	}

	pub fn is_reading(&self, fd: RawFd) -> bool {
		self.readers.borrow().contains_key(&fd)
	}

	pub fn is_writing(&self, fd: RawFd) -> bool {
		self.writers.borrow().contains_key(&fd)
	}

	pub fn registrations(&self) -> usize {
		self.readers.borrow().len() + self.writers.borrow().len()
	}

	pub fn pending_calls(&self) -> usize {
		self.timers.borrow().len()
	}

	pub fn stale(&self) -> usize {
		self.stale.get()
	}

	/// Runs every call due at the current virtual time, including calls
	/// they schedule for "now".
	pub fn run_due(&self) {
		loop {
			let next = {
				let mut timers = self.timers.borrow_mut();
				match timers.keys().next().copied() {
					Some(key) if key.0 <= self.now.get() => timers.remove(&key).map(|f| (key.1, f)),
					_ => None,
				}
			};
			let Some((id, f)) = next else { break };
			self.due.borrow_mut().remove(&id);
			f();
		}
	}

	/// Moves the clock forward and runs what became due.
	pub fn advance(&self, by: Duration) {
		self.now.set(self.now.get() + by);
		self.run_due();
	}

	/// One loop turn: due calls, one poll of at most `wait`, dispatch, due
	/// calls again.
	pub fn iterate(&self, wait: Duration) {
		self.run_due();

		let mut interest: BTreeMap<RawFd, libc::c_short> = BTreeMap::new();
		for fd in self.readers.borrow().keys() {
			*interest.entry(*fd).or_default() |= libc::POLLIN;
		}
		for fd in self.writers.borrow().keys() {
			*interest.entry(*fd).or_default() |= libc::POLLOUT;
		}
		let mut fds: Vec<libc::pollfd> = interest
			.into_iter()
			.map(|(fd, events)| libc::pollfd { fd, events, revents: 0 })
			.collect();

		let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait.as_millis() as libc::c_int) };
		if n > 0 {
			for pfd in &fds {
				if pfd.revents & libc::POLLNVAL != 0 {
					self.stale.set(self.stale.get() + 1);
					continue;
				}
				if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
					let source = self.readers.borrow().get(&pfd.fd).cloned();
					if let Some(source) = source {
						source.do_read();
					}
				}
				if pfd.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0 {
					let source = self.writers.borrow().get(&pfd.fd).cloned();
					if let Some(source) = source {
						source.do_write();
					}
				}
			}
		}
		self.run_due();
	}

	/// Iterates until `done` holds, giving up after `turns` turns.
	pub fn run_until(&self, turns: usize, mut done: impl FnMut() -> bool) -> bool {
		for _ in 0..turns {
			if done() {
				return true;
			}
			self.iterate(Duration::from_millis(20));
		}
		done()
	}
}

impl Reactor for TestReactor {
	fn add_reader(&self, source: Rc<dyn Selectable>) {
		let fd = source.fileno();
		self.readers.borrow_mut().entry(fd).or_insert(source);
	}

	fn add_writer(&self, source: Rc<dyn Selectable>) {
		let fd = source.fileno();
		self.writers.borrow_mut().entry(fd).or_insert(source);
	}

	fn remove_reader(&self, fd: RawFd) {
		self.readers.borrow_mut().remove(&fd);
	}

	fn remove_writer(&self, fd: RawFd) {
		self.writers.borrow_mut().remove(&fd);
	}

	fn call_later(&self, delay: Duration, f: Box<dyn FnOnce()>) -> DelayedCall {
		let id = self.next_id.get();
		self.next_id.set(id + 1);
		let at = self.now.get() + delay;
		self.timers.borrow_mut().insert((at, id), f);
		self.due.borrow_mut().insert(id, at);
		DelayedCall::new(id)
	}

	fn cancel_call(&self, call: DelayedCall) {
		if let Some(at) = self.due.borrow_mut().remove(&call.id()) {
			self.timers.borrow_mut().remove(&(at, call.id()));
		}
	}

	fn resolve(&self, name: &str, done: ResolveCallback) {
		if let Some(slot) = self.held.borrow_mut().iter_mut().find(|(held, _)| held == name) {
			slot.1 = Some(done);
			return;
		}
		let answer = self.names.borrow().get(name).copied();
		self.call_later(Duration::ZERO, Box::new(move || done(answer)));
	}
}

/// What a [`Recorder`] saw.
#[derive(Default)]
pub struct Seen {
	pub transport: RefCell<Option<Rc<dyn Transport>>>,
	pub data: RefCell<Vec<u8>>,
	pub read_closed: Cell<bool>,
	pub lost: RefCell<Option<CloseReason>>,
}

impl Seen {
	pub fn transport(&self) -> Rc<dyn Transport> {
		self.transport.borrow().clone().expect("not connected yet")
	}

	pub fn is_lost(&self) -> bool {
		self.lost.borrow().is_some()
	}

	pub fn received(&self) -> usize {
		self.data.borrow().len()
	}
}

/// Keeps every byte and the close reason; echoes when asked to.
pub struct Recorder {
	pub seen: Rc<Seen>,
	pub echo: bool,
	/// Answer `read_connection_lost` with this.
	pub half_close: bool,
}

impl Recorder {
	pub fn new(seen: Rc<Seen>) -> Self {
		Self {
			seen,
			echo: false,
			half_close: false,
		}
	}
}

impl Protocol for Recorder {
	fn make_connection(&mut self, transport: Rc<dyn Transport>) {
		*self.seen.transport.borrow_mut() = Some(transport);
	}

	fn data_received(&mut self, data: &[u8]) {
		self.seen.data.borrow_mut().extend_from_slice(data);
		if self.echo {
			self.seen.transport().write(data);
		}
	}

	fn read_connection_lost(&mut self) -> bool {
		self.seen.read_closed.set(true);
		self.half_close
	}

	fn connection_lost(&mut self, reason: CloseReason) {
		*self.seen.lost.borrow_mut() = Some(reason);
		// drop the transport so the connection can be freed
		self.seen.transport.borrow_mut().take();
	}
}

/// Server-side factory that records every connection it builds.
#[derive(Default)]
pub struct ServerFactory {
	pub echo: bool,
	pub refuse: bool,
	pub connections: Vec<(Address, Rc<Seen>)>,
	pub starts: usize,
	pub stops: usize,
}

impl ServerFactory {
	pub fn shared(echo: bool) -> Rc<RefCell<ServerFactory>> {
		Rc::new(RefCell::new(ServerFactory {
			echo,
			..Default::default()
		}))
	}
}

impl Factory for ServerFactory {
	fn do_start(&mut self) {
		self.starts += 1;
	}

	fn do_stop(&mut self) {
		self.stops += 1;
	}

	fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>> {
		if self.refuse {
			return None;
		}
		let seen = Rc::new(Seen::default());
		self.connections.push((addr.clone(), seen.clone()));
		let mut protocol = Recorder::new(seen);
		protocol.echo = self.echo;
		Some(Box::new(protocol))
	}

	fn log_prefix(&self) -> String {
		String::from("ServerFactory")
	}
}

/// Client-side factory recording outcomes.
#[derive(Default)]
pub struct ClientRecorder {
	pub seen: Vec<Rc<Seen>>,
	pub started: usize,
	pub failures: Vec<ConnectError>,
	pub losses: Vec<CloseReason>,
	pub starts: usize,
	pub stops: usize,
}

impl ClientRecorder {
	pub fn shared() -> Rc<RefCell<ClientRecorder>> {
		Rc::new(RefCell::new(ClientRecorder::default()))
	}

	pub fn last(&self) -> Rc<Seen> {
		self.seen.last().cloned().expect("no protocol built")
	}
}

impl Factory for ClientRecorder {
	fn do_start(&mut self) {
		self.starts += 1;
	}

	fn do_stop(&mut self) {
		self.stops += 1;
	}

	fn build_protocol(&mut self, _addr: &Address) -> Option<Box<dyn Protocol>> {
		let seen = Rc::new(Seen::default());
		self.seen.push(seen.clone());
		Some(Box::new(Recorder::new(seen)))
	}

	fn log_prefix(&self) -> String {
		String::from("ClientRecorder")
	}
}

impl ClientFactory for ClientRecorder {
	fn started_connecting(&mut self, _connector: &dyn ConnectorControl) {
		self.started += 1;
	}

	fn client_connection_failed(&mut self, _connector: &dyn ConnectorControl, reason: ConnectError) {
		self.failures.push(reason);
	}

	fn client_connection_lost(&mut self, _connector: &dyn ConnectorControl, reason: CloseReason) {
		self.losses.push(reason);
	}
}
