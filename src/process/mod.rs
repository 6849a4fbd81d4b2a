//! Child processes as transports: stdin, stdout, stderr and any extra
//! child descriptors on pipes, with exit status collection through an
//! explicit [`ProcessReaper`].
//!
//! ```text
//!            ┌── fd 0 pipe ──▶ child
//!  Process ──┼── fd 1 pipe ◀── child
//!            ├── fd 2 pipe ◀── child
//!            └── fd N pipe ◀─▶ child   (SpawnConfig::child_fd)
//!
//!  process_ended fires once: every pipe closed AND child reaped
//! ```

mod pipe;
mod spawn;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use tracing::{debug, error};

use crate::config::SpawnConfig;
use crate::error::{CloseReason, TransportError, errno, errno_name};
use crate::protocol::{ProcessProtocol, ProcessTransport};
use crate::reactor::{Reactor, call_soon};

use self::pipe::Pipe;

/// How a child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnded {
	/// Exited with status 0.
	Done,
	/// Non-zero exit code, or killed by `signal`.
	Terminated { exit_code: Option<i32>, signal: Option<i32> },
}

impl ProcessEnded {
	/// Decodes a `waitpid` status.
	pub fn from_wait_status(status: i32) -> Self {
		if libc::WIFEXITED(status) {
			match libc::WEXITSTATUS(status) {
				0 => ProcessEnded::Done,
				code => ProcessEnded::Terminated {
					exit_code: Some(code),
					signal: None,
				},
			}
		} else if libc::WIFSIGNALED(status) {
			ProcessEnded::Terminated {
				exit_code: None,
				signal: Some(libc::WTERMSIG(status)),
			}
		} else {
			ProcessEnded::Terminated {
				exit_code: None,
				signal: None,
			}
		}
	}

	pub fn is_clean(&self) -> bool {
		matches!(self, ProcessEnded::Done)
	}
}

impl fmt::Display for ProcessEnded {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProcessEnded::Done => f.write_str("process ended with status 0"),
			ProcessEnded::Terminated { exit_code: Some(code), .. } => write!(f, "process ended with status {}", code),
			ProcessEnded::Terminated { signal: Some(sig), .. } => write!(f, "process killed by signal {}", sig),
			ProcessEnded::Terminated { .. } => f.write_str("process ended"),
		}
	}
}

/// A signal for [`ProcessTransport::signal_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
	Kill,
	Term,
	Int,
	Hup,
	Other(i32),
}

impl Signal {
	pub fn raw(self) -> i32 {
		match self {
			Signal::Kill => libc::SIGKILL,
			Signal::Term => libc::SIGTERM,
			Signal::Int => libc::SIGINT,
			Signal::Hup => libc::SIGHUP,
			Signal::Other(n) => n,
		}
	}
}

impl FromStr for Signal {
	type Err = TransportError;

	/// `KILL`, `TERM`, `INT` and `HUP`, with or without the `SIG` prefix.
	fn from_str(name: &str) -> Result<Self, Self::Err> {
		match name.strip_prefix("SIG").unwrap_or(name) {
			"KILL" => Ok(Signal::Kill),
			"TERM" => Ok(Signal::Term),
			"INT" => Ok(Signal::Int),
			"HUP" => Ok(Signal::Hup),
			_ => Err(TransportError::UnknownSignal { name: name.to_owned() }),
		}
	}
}

/// Tracks the completions a process waits for before it ends: one per
/// pipe, plus the reap.
#[derive(Debug)]
pub(crate) struct Lifecycle {
	open: BTreeSet<RawFd>,
	exit: Option<ProcessEnded>,
	ended: bool,
}

impl Lifecycle {
	pub(crate) fn new<I: IntoIterator<Item = RawFd>>(pipes: I) -> Self {
		Self {
			open: pipes.into_iter().collect(),
			exit: None,
			ended: false,
		}
	}

	pub(crate) fn pipe_closed(&mut self, child_fd: RawFd) -> Option<ProcessEnded> {
		self.open.remove(&child_fd);
		self.ready()
	}

	pub(crate) fn exited(&mut self, status: ProcessEnded) -> Option<ProcessEnded> {
		self.exit.get_or_insert(status);
		self.ready()
	}

	pub(crate) fn pipes_closed(&self) -> bool {
		self.open.is_empty()
	}

	pub(crate) fn has_exited(&self) -> bool {
		self.exit.is_some()
	}

	fn ready(&mut self) -> Option<ProcessEnded> {
		if self.ended || !self.pipes_closed() {
			return None;
		}
		let status = self.exit?;
		self.ended = true;
		Some(status)
	}
}

/// Collects exit statuses for registered children.
///
/// Nothing here listens for `SIGCHLD`; whoever owns the signal handling
/// calls [`reap_all`](Self::reap_all) when a child may have exited.
#[derive(Default)]
pub struct ProcessReaper {
	children: RefCell<HashMap<i32, Rc<Process>>>,
}

impl ProcessReaper {
	pub fn new() -> Rc<Self> {
		Rc::new(Self::default())
	}

	/// Reaps the child straight away if it is already gone, otherwise keeps
	/// it until a later `reap_all`.
	fn register(&self, process: Rc<Process>) {
		let Some(pid) = process.pid() else { return };
		if !process.try_reap() {
			self.children.borrow_mut().insert(pid, process);
		}
	}

	fn unregister(&self, pid: i32) {
		self.children.borrow_mut().remove(&pid);
	}

	/// Polls every registered child without blocking.
	pub fn reap_all(&self) {
		let children: Vec<Rc<Process>> = self.children.borrow().values().cloned().collect();
		for process in children {
			process.try_reap();
		}
	}

	/// Children not yet reaped.
	pub fn pending(&self) -> usize {
		self.children.borrow().len()
	}
}

/// A running child process bound to a [`ProcessProtocol`].
pub struct Process {
	this: Weak<Self>,
	reactor: Rc<dyn Reactor>,
	reaper: Weak<ProcessReaper>,
	pid: Cell<Option<i32>>,
	protocol: RefCell<Option<Box<dyn ProcessProtocol>>>,
	/// Open pipes by child descriptor.
	pipes: RefCell<BTreeMap<RawFd, Rc<Pipe>>>,
	lifecycle: RefCell<Lifecycle>,
	status: Cell<Option<ProcessEnded>>,
}

impl Process {
	/// Forks and execs `config`, wires the pipes into the reactor and hands
	/// the transport to `protocol`.
	pub fn spawn(
		reactor: Rc<dyn Reactor>,
		reaper: &Rc<ProcessReaper>,
		protocol: Box<dyn ProcessProtocol>,
		config: &SpawnConfig,
	) -> Result<Rc<Self>, TransportError> {
		let child = spawn::spawn(config)?;
		debug!(pid = child.pid, program = %config.program.display(), pipes = child.pipes.len(), "spawned");

		let process = Rc::new_cyclic(|this| Self {
			this: this.clone(),
			reactor: reactor.clone(),
			reaper: Rc::downgrade(reaper),
			pid: Cell::new(Some(child.pid)),
			protocol: RefCell::new(Some(protocol)),
			pipes: RefCell::new(BTreeMap::new()),
			lifecycle: RefCell::new(Lifecycle::new(child.pipes.iter().map(|end| end.child_fd))),
			status: Cell::new(None),
		});

		let pipes: Vec<Rc<Pipe>> = child
			.pipes
			.into_iter()
			.map(|end| Pipe::new(reactor.clone(), end.child_fd, end.to_child, end.fd, process.clone()))
			.collect();
		*process.pipes.borrow_mut() = pipes.iter().map(|pipe| (pipe.child_fd(), pipe.clone())).collect();

		for pipe in &pipes {
			pipe.start();
		}
		let transport: Rc<dyn ProcessTransport> = process.clone();
		if let Some(protocol) = process.protocol.borrow_mut().as_mut() {
			protocol.make_connection(transport);
		}
		reaper.register(process.clone());
		Ok(process)
	}

	/// Exit status once reaped.
	pub fn status(&self) -> Option<ProcessEnded> {
		self.status.get()
	}

	/// Bytes queued for the child's stdin.
	pub fn pending_stdin(&self) -> usize {
		self.pipes.borrow().get(&0).map_or(0, |pipe| pipe.pending_bytes())
	}

	fn pipe(&self, child_fd: RawFd) -> Option<Rc<Pipe>> {
		self.pipes.borrow().get(&child_fd).cloned()
	}

	/// Flushes and closes every pipe towards the child.
	fn close_writers(&self) {
		let writers: Vec<Rc<Pipe>> = self.pipes.borrow().values().filter(|pipe| pipe.is_to_child()).cloned().collect();
		for pipe in writers {
			pipe.lose_connection();
		}
	}

	/// Runs `f` on the protocol now, or on the next turn if a protocol
	/// callback is already running further up the stack.
	fn with_protocol(&self, f: impl FnOnce(&mut dyn ProcessProtocol) + 'static) {
		match self.protocol.try_borrow_mut() {
			Ok(mut slot) => {
				if let Some(protocol) = slot.as_mut() {
					f(protocol.as_mut());
				}
			}
			Err(_) => {
				let this = self.this.clone();
				call_soon(&self.reactor, move || {
					if let Some(this) = this.upgrade() {
						this.with_protocol(f);
					}
				});
			}
		}
	}

	pub(crate) fn child_output(&self, child_fd: RawFd, data: &[u8]) {
		match self.protocol.try_borrow_mut() {
			Ok(mut slot) => {
				if let Some(protocol) = slot.as_mut() {
					protocol.child_data_received(child_fd, data);
				}
			}
			Err(_) => {
				let data = data.to_vec();
				self.with_protocol(move |protocol| protocol.child_data_received(child_fd, &data));
			}
		}
	}

	pub(crate) fn pipe_lost(&self, child_fd: RawFd, reason: CloseReason) {
		drop(self.pipes.borrow_mut().remove(&child_fd));
		debug!(pid = ?self.pid.get(), child_fd, reason = %reason, "pipe closed");

		self.with_protocol(move |protocol| protocol.child_connection_lost(child_fd));
		let ready = self.lifecycle.borrow_mut().pipe_closed(child_fd);
		self.maybe_end(ready);
	}

	/// Non-blocking `waitpid`. Returns `true` once the child is reaped.
	fn try_reap(&self) -> bool {
		let Some(pid) = self.pid.get() else {
			return true;
		};
		let mut status = 0;
		let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
		match rc {
			0 => false,
			-1 => {
				let code = errno();
				if code == libc::ECHILD {
					// somebody else reaped it; the status is lost
					self.reaped(pid, ProcessEnded::Terminated {
						exit_code: None,
						signal: None,
					});
					return true;
				}
				error!(pid, errno = errno_name(code), "waitpid failed");
				false
			}
			_ => {
				self.reaped(pid, ProcessEnded::from_wait_status(status));
				true
			}
		}
	}

	fn reaped(&self, pid: i32, status: ProcessEnded) {
		self.pid.set(None);
		self.status.set(Some(status));
		debug!(pid, status = %status, "reaped");
		if let Some(reaper) = self.reaper.upgrade() {
			reaper.unregister(pid);
		}
		self.with_protocol(move |protocol| protocol.process_exited(status));
		self.close_writers();
		let ready = self.lifecycle.borrow_mut().exited(status);
		self.maybe_end(ready);
	}

	fn maybe_end(&self, ready: Option<ProcessEnded>) {
		if let Some(status) = ready {
			self.end(status);
			return;
		}
		let (pipes_closed, exited) = {
			let lifecycle = self.lifecycle.borrow();
			(lifecycle.pipes_closed(), lifecycle.has_exited())
		};
		if pipes_closed && !exited {
			self.try_reap();
		}
	}
}

impl Process {
	/// Delivers `process_ended` and lets go of the protocol.
	fn end(&self, status: ProcessEnded) {
		let protocol = match self.protocol.try_borrow_mut() {
			Ok(mut slot) => slot.take(),
			Err(_) => {
				let this = self.this.clone();
				call_soon(&self.reactor, move || {
					if let Some(this) = this.upgrade() {
						this.end(status);
					}
				});
				return;
			}
		};
		debug!(status = %status, "process ended");
		if let Some(mut protocol) = protocol {
			protocol.process_ended(status);
		}
	}
}

impl ProcessTransport for Process {
	fn write_to_child(&self, child_fd: RawFd, data: &[u8]) {
		match self.pipe(child_fd) {
			Some(pipe) if pipe.is_to_child() => pipe.write(data),
			_ => {}
		}
	}

	fn close_child_fd(&self, child_fd: RawFd) {
		if let Some(pipe) = self.pipe(child_fd) {
			pipe.lose_connection();
		}
	}

	fn lose_connection(&self) {
		let pipes: Vec<Rc<Pipe>> = self.pipes.borrow().values().cloned().collect();
		for pipe in pipes {
			pipe.lose_connection();
		}
	}

	fn signal_process(&self, signal: Signal) -> Result<(), TransportError> {
		let pid = self.pid.get().ok_or(TransportError::ProcessExitedAlready)?;
		if unsafe { libc::kill(pid, signal.raw()) } == -1 {
			return match errno() {
				libc::ESRCH => Err(TransportError::ProcessExitedAlready),
				code => Err(TransportError::Signal { errno: code }),
			};
		}
		Ok(())
	}

	fn pid(&self) -> Option<i32> {
		self.pid.get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, Copy)]
	enum Event {
		Pipe(RawFd),
		Exit,
	}

	fn permutations(items: &[Event]) -> Vec<Vec<Event>> {
		if items.len() <= 1 {
			return vec![items.to_vec()];
		}
		let mut out = Vec::new();
		for i in 0..items.len() {
			let mut rest = items.to_vec();
			let head = rest.remove(i);
			for mut tail in permutations(&rest) {
				tail.insert(0, head);
				out.push(tail);
			}
		}
		out
	}

	#[test]
	fn process_ends_once_after_all_four_events_in_any_order() {
		let events = [Event::Pipe(0), Event::Pipe(1), Event::Pipe(2), Event::Exit];
		let status = ProcessEnded::Terminated {
			exit_code: Some(3),
			signal: None,
		};
		let orders = permutations(&events);
		assert_eq!(orders.len(), 24);

		for order in orders {
			let mut lifecycle = Lifecycle::new([0, 1, 2]);
			let mut fired = Vec::new();
			for (i, event) in order.iter().enumerate() {
				let ready = match event {
					Event::Pipe(stream) => lifecycle.pipe_closed(*stream),
					Event::Exit => lifecycle.exited(status),
				};
				if let Some(status) = ready {
					fired.push((i, status));
				}
			}
			assert_eq!(fired, vec![(3, status)], "order {:?}", order);
		}
	}

	#[test]
	fn repeated_events_do_not_refire() {
		let mut lifecycle = Lifecycle::new([0, 1, 2]);
		lifecycle.exited(ProcessEnded::Done);
		lifecycle.pipe_closed(0);
		lifecycle.pipe_closed(1);
		assert_eq!(lifecycle.pipe_closed(2), Some(ProcessEnded::Done));
		assert_eq!(lifecycle.pipe_closed(2), None);
		assert_eq!(lifecycle.exited(ProcessEnded::Done), None);
	}

	#[test]
	fn extra_pipes_hold_the_end_back() {
		let mut lifecycle = Lifecycle::new([0, 1, 2, 3]);
		for fd in 0..3 {
			assert_eq!(lifecycle.pipe_closed(fd), None);
		}
		assert_eq!(lifecycle.exited(ProcessEnded::Done), None);
		assert_eq!(lifecycle.pipe_closed(3), Some(ProcessEnded::Done));

		// nothing but the reap to wait for
		let mut bare = Lifecycle::new([]);
		assert_eq!(bare.exited(ProcessEnded::Done), Some(ProcessEnded::Done));
	}

	#[test]
	fn wait_status_decoding() {
		assert_eq!(ProcessEnded::from_wait_status(0), ProcessEnded::Done);
		assert_eq!(
			ProcessEnded::from_wait_status(2 << 8),
			ProcessEnded::Terminated {
				exit_code: Some(2),
				signal: None
			}
		);
		assert_eq!(
			ProcessEnded::from_wait_status(libc::SIGKILL),
			ProcessEnded::Terminated {
				exit_code: None,
				signal: Some(libc::SIGKILL)
			}
		);
	}

	#[test]
	fn signal_names_parse() {
		assert_eq!("KILL".parse::<Signal>(), Ok(Signal::Kill));
		assert_eq!("SIGHUP".parse::<Signal>(), Ok(Signal::Hup));
		assert_eq!(
			"STOPIT".parse::<Signal>(),
			Err(TransportError::UnknownSignal { name: "STOPIT".into() })
		);
		assert_eq!(Signal::Term.raw(), libc::SIGTERM);
	}
}
