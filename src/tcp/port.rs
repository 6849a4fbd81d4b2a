use std::cell::{Cell, RefCell};
use std::fs;
use std::io::Write as _;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, warn};

use super::{Connection, Side};
use crate::addr::{Address, Domain, SockAddr, SocketKind};
use crate::config::{AcceptPolicy, PortConfig};
use crate::deferred::Deferred;
use crate::error::{CannotListenError, CloseReason, errno_name};
use crate::handle::Handle;
use crate::protocol::{Factory, with_factory};
use crate::reactor::{DelayedCall, Reactor, Selectable};
use crate::socket::{AcceptResult, ConnectedStream, ListeningSocket, RawSocket, Stream};

/// Accept failures that mean the process or system is out of something.
/// Retrying straight away would spin, so the port backs off instead.
const EXHAUSTION: [i32; 5] = [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM, libc::ECONNABORTED];

/// How many accepts one readiness event may perform.
///
/// Grows by `step` after a pass that used its whole budget, up to `max`.
/// Drops to what the last pass accepted (at least one) as soon as accept
/// would block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptBudget {
	current: usize,
	policy: AcceptPolicy,
}

impl AcceptBudget {
	pub fn new(policy: AcceptPolicy) -> Self {
		Self {
			current: policy.initial.clamp(1, policy.max.max(1)),
			policy,
		}
	}

	pub fn current(&self) -> usize {
		self.current
	}

	/// Every accept in the pass succeeded.
	pub fn full_pass(&mut self) {
		self.current = (self.current + self.policy.step).min(self.policy.max.max(1));
	}

	/// Accept would block after `accepted` connections.
	pub fn would_block(&mut self, accepted: usize) {
		self.current = accepted.clamp(1, self.policy.max.max(1));
	}
}

/// A listening stream socket handing each accepted connection to a new
/// server [`Connection`].
pub struct Port<D: Domain> {
	this: Weak<Self>,
	reactor: Rc<dyn Reactor>,
	handle: Handle,
	factory: Rc<RefCell<dyn Factory>>,
	factory_prefix: String,
	addr: D::Addr,
	config: PortConfig,
	socket: RefCell<Option<ListeningSocket<D>>>,
	bound: RefCell<Option<D::Addr>>,
	budget: Cell<AcceptBudget>,
	sessions: Cell<u64>,
	listening: Cell<bool>,
	resume_call: Cell<Option<DelayedCall>>,
	/// Socket file to unlink on close (filesystem UNIX sockets only).
	unlink_path: RefCell<Option<PathBuf>>,
	lock_path: RefCell<Option<PathBuf>>,
	stopped: RefCell<Option<Deferred<()>>>,
}

impl<D: Domain> Port<D> {
	/// Creates an idle port. Nothing is bound until `start_listening`.
	pub fn new(reactor: Rc<dyn Reactor>, addr: D::Addr, factory: Rc<RefCell<dyn Factory>>, config: PortConfig) -> Rc<Self> {
		let factory_prefix = factory.borrow().log_prefix();
		Rc::new_cyclic(|this: &Weak<Self>| {
			let owner: Weak<dyn Selectable> = this.clone();
			Self {
				this: this.clone(),
				handle: Handle::new(reactor.clone(), -1, owner),
				reactor,
				factory,
				factory_prefix,
				addr,
				budget: Cell::new(AcceptBudget::new(config.accept)),
				config,
				socket: RefCell::new(None),
				bound: RefCell::new(None),
				sessions: Cell::new(0),
				listening: Cell::new(false),
				resume_call: Cell::new(None),
				unlink_path: RefCell::new(None),
				lock_path: RefCell::new(None),
				stopped: RefCell::new(None),
			}
		})
	}

	/// Creates a port and starts it.
	pub fn listen(
		reactor: Rc<dyn Reactor>,
		addr: D::Addr,
		factory: Rc<RefCell<dyn Factory>>,
		config: PortConfig,
	) -> Result<Rc<Self>, CannotListenError> {
		let port = Self::new(reactor, addr, factory, config);
		port.start_listening()?;
		Ok(port)
	}

	fn fs_path(&self) -> Option<PathBuf> {
		match self.addr.to_address(SocketKind::Tcp) {
			Address::Unix { path } => path,
			_ => None,
		}
	}

	fn is_unix(&self) -> bool {
		matches!(self.addr.to_address(SocketKind::Tcp), Address::Unix { .. })
	}

	/// Binds, listens and arms read readiness. Failures come back here, not
	/// through the factory.
	pub fn start_listening(&self) -> Result<(), CannotListenError> {
		let where_ = self.addr.to_string();
		if self.listening.get() || self.handle.is_disconnected() {
			return Err(CannotListenError::AlreadyListening { addr: where_ });
		}

		let fs_path = self.fs_path();
		let lock_path = match (&fs_path, self.config.unix.want_pid) {
			(Some(path), true) => {
				let lock = lock_file_for(path);
				check_lock(&lock, path, &where_)?;
				Some(lock)
			}
			_ => None,
		};

		let socket = RawSocket::<D, Stream>::new().map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;
		let setup = if self.is_unix() {
			self.config.buffers.apply(&socket)
		} else {
			self.config.reuse.apply(&socket).and_then(|()| self.config.buffers.apply(&socket))
		};
		setup.map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;

		let bound = socket
			.bind(&self.addr)
			.map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;

		// from here on a failure must not leave the socket file behind
		let finish = || -> Result<_, CannotListenError> {
			if let (Some(path), Some(mode)) = (&fs_path, self.config.unix.mode) {
				fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| CannotListenError::Os {
					addr: where_.clone(),
					errno: e.raw_os_error().unwrap_or(libc::EIO),
				})?;
			}
			let listener = bound
				.listen(self.config.backlog)
				.map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;
			if let Some(lock) = &lock_path {
				write_lock(lock).map_err(|e| CannotListenError::Os {
					addr: where_.clone(),
					errno: e.raw_os_error().unwrap_or(libc::EIO),
				})?;
			}
			Ok(listener)
		};
		let listener = match finish() {
			Ok(listener) => listener,
			Err(err) => {
				if let Some(path) = &fs_path {
					let _ = fs::remove_file(path);
				}
				return Err(err);
			}
		};

		*self.bound.borrow_mut() = listener.local_addr().ok();
		self.handle.attach(listener.as_raw_fd());
		*self.socket.borrow_mut() = Some(listener);
		*self.unlink_path.borrow_mut() = fs_path;
		*self.lock_path.borrow_mut() = lock_path;
		self.handle.set_connected();
		self.listening.set(true);

		info!(prefix = %self.factory_prefix, addr = %self.get_host(), backlog = self.config.backlog, "starting on");
		with_factory(&self.reactor, &self.factory, |factory| factory.do_start());
		self.handle.start_reading();
		Ok(())
	}

	/// Stops accepting. The returned deferred fires once the socket is
	/// closed and the factory's `do_stop` has run.
	pub fn stop_listening(&self) -> Deferred<()> {
		if let Some(stopped) = self.stopped.borrow().as_ref() {
			return stopped.clone();
		}
		if !self.listening.get() {
			return Deferred::fired(());
		}
		let stopped = Deferred::new();
		*self.stopped.borrow_mut() = Some(stopped.clone());
		self.handle.stop_reading();
		if let Some(call) = self.resume_call.take() {
			self.reactor.cancel_call(call);
		}
		self.handle.schedule_teardown(CloseReason::Done);
		stopped
	}

	/// The bound address, with the real port when port 0 was requested.
	pub fn local_addr(&self) -> Option<D::Addr> {
		self.bound.borrow().clone()
	}

	pub fn get_host(&self) -> Address {
		match self.bound.borrow().as_ref() {
			Some(addr) => addr.to_address(SocketKind::Tcp),
			None => self.addr.to_address(SocketKind::Tcp),
		}
	}

	/// Number of server connections created so far.
	pub fn sessions(&self) -> u64 {
		self.sessions.get()
	}

	pub fn accept_budget(&self) -> usize {
		self.budget.get().current()
	}

	pub fn is_listening(&self) -> bool {
		self.listening.get()
	}

	pub fn is_reading(&self) -> bool {
		self.handle.is_reading()
	}

	fn stopping(&self) -> bool {
		self.stopped.borrow().is_some()
	}

	fn accept_one(&self) -> Option<Result<AcceptResult<D>, i32>> {
		let socket = self.socket.borrow();
		let listener = socket.as_ref()?;
		Some(listener.accept_nonblocking().map_err(|e| e.errno()))
	}

	/// Stops reading for the configured cooldown.
	fn back_off(&self, errno: i32) {
		let cooldown = self.config.exhaustion_cooldown;
		warn!(
			prefix = %self.factory_prefix,
			errno = errno_name(errno),
			cooldown_ms = cooldown.as_millis() as u64,
			"accept failed, pausing"
		);
		self.handle.stop_reading();
		let this = self.this.clone();
		let call = self.reactor.call_later(
			cooldown,
			Box::new(move || {
				if let Some(port) = this.upgrade() {
					port.resume_call.set(None);
					if port.listening.get() && !port.stopping() {
						debug!(prefix = %port.factory_prefix, "resuming accept");
						port.handle.start_reading();
					}
				}
			}),
		);
		if let Some(old) = self.resume_call.replace(Some(call)) {
			self.reactor.cancel_call(old);
		}
	}

	fn accepted(&self, stream: ConnectedStream<D>, peer: D::Addr) {
		let peer = peer.to_address(SocketKind::Tcp);
		let protocol = match self.factory.try_borrow_mut() {
			Ok(mut factory) => factory.build_protocol(&peer),
			Err(_) => {
				error!(prefix = %self.factory_prefix, peer = %peer, "factory busy, dropping connection");
				None
			}
		};
		let Some(protocol) = protocol else {
			debug!(prefix = %self.factory_prefix, peer = %peer, "factory refused connection");
			return;
		};

		let session = self.sessions.get();
		self.sessions.set(session + 1);

		if let Err(e) = self.config.tcp.apply(&stream, self.is_unix()) {
			debug!(prefix = %self.factory_prefix, error = %e, "could not apply socket options");
		}
		let host = stream
			.local_addr()
			.map(|addr| addr.to_address(SocketKind::Tcp))
			.unwrap_or_else(|_| self.get_host());
		let prefix = format!("{},{},{}", self.factory_prefix, session, peer.host());

		let conn = Connection::new(
			self.reactor.clone(),
			stream,
			protocol,
			prefix,
			host,
			peer,
			Side::Server { session },
			self.config.read_size,
		);
		conn.start();
	}

	fn close(&self, reason: CloseReason) {
		if !self.handle.mark_closed() {
			return;
		}
		self.listening.set(false);
		if let Some(call) = self.resume_call.take() {
			self.reactor.cancel_call(call);
		}
		drop(self.socket.borrow_mut().take());
		if let Some(path) = self.unlink_path.borrow_mut().take() {
			let _ = fs::remove_file(path);
		}
		if let Some(lock) = self.lock_path.borrow_mut().take() {
			let _ = fs::remove_file(lock);
		}
		info!(prefix = %self.factory_prefix, addr = %self.get_host(), reason = %reason, "port closed");

		let stopped = self.stopped.borrow_mut().get_or_insert_with(Deferred::new).clone();
		with_factory(&self.reactor, &self.factory, move |factory| {
			factory.do_stop();
			stopped.fire(());
		});
	}
}

impl<D: Domain> Selectable for Port<D> {
	fn fileno(&self) -> RawFd {
		self.handle.fileno()
	}

	fn do_read(&self) {
		let mut budget = self.budget.get();
		for i in 0..budget.current() {
			// a protocol may have stopped us from inside build_protocol
			if !self.listening.get() || self.stopping() || !self.handle.is_reading() {
				return;
			}
			let Some(result) = self.accept_one() else { return };
			match result {
				Ok(AcceptResult::Connection(stream, peer)) => self.accepted(stream, peer),
				Ok(AcceptResult::Interrupted) => {}
				Ok(AcceptResult::WouldBlock) => {
					budget.would_block(i);
					self.budget.set(budget);
					return;
				}
				Err(errno) if EXHAUSTION.contains(&errno) => {
					self.back_off(errno);
					return;
				}
				// firewall refusal of one peer; keep going
				Err(libc::EPERM) => {}
				Err(errno) => {
					error!(prefix = %self.factory_prefix, errno = errno_name(errno), "accept failed");
					return;
				}
			}
		}
		budget.full_pass();
		self.budget.set(budget);
	}

	fn do_write(&self) {
		error!(prefix = %self.factory_prefix, "write readiness on a listening port");
		self.handle.stop_writing();
	}

	fn connection_lost(&self, reason: CloseReason) {
		self.close(reason);
	}

	fn log_prefix(&self) -> String {
		self.factory_prefix.clone()
	}
}

fn lock_file_for(path: &std::path::Path) -> PathBuf {
	let mut lock = path.as_os_str().to_owned();
	lock.push(".lock");
	PathBuf::from(lock)
}

/// Refuses to start if a live process holds the lock. A lock naming a dead
/// process means the socket file is stale and is removed.
fn check_lock(lock: &std::path::Path, socket: &std::path::Path, addr: &str) -> Result<(), CannotListenError> {
	let Ok(text) = fs::read_to_string(lock) else {
		return Ok(());
	};
	if let Ok(pid) = text.trim().parse::<i32>() {
		if pid > 0 && process_alive(pid) {
			return Err(CannotListenError::Locked {
				addr: addr.to_owned(),
				pid,
			});
		}
	}
	debug!(lock = %lock.display(), "removing stale socket");
	let _ = fs::remove_file(socket);
	let _ = fs::remove_file(lock);
	Ok(())
}

fn process_alive(pid: i32) -> bool {
	let rc = unsafe { libc::kill(pid, 0) };
	rc == 0 || crate::error::errno() == libc::EPERM
}

fn write_lock(lock: &std::path::Path) -> std::io::Result<()> {
	let mut file = fs::File::create(lock)?;
	write!(file, "{}", std::process::id())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn budget_grows_by_step_up_to_max() {
		let mut budget = AcceptBudget::new(AcceptPolicy::new().initial(990));
		assert_eq!(budget.current(), 990);
		budget.full_pass();
		assert_eq!(budget.current(), 1000);
		budget.full_pass();
		assert_eq!(budget.current(), 1000);
	}

	#[test]
	fn budget_shrinks_to_what_was_accepted() {
		let mut budget = AcceptBudget::new(AcceptPolicy::default());
		budget.would_block(7);
		assert_eq!(budget.current(), 7);
		budget.would_block(0);
		assert_eq!(budget.current(), 1);
		budget.full_pass();
		assert_eq!(budget.current(), 21);
	}

	#[test]
	fn single_policy_never_grows() {
		let mut budget = AcceptBudget::new(AcceptPolicy::single());
		budget.full_pass();
		budget.full_pass();
		assert_eq!(budget.current(), 1);
	}

	#[test]
	fn lock_file_sits_next_to_socket() {
		assert_eq!(lock_file_for("/tmp/app.sock".as_ref()), PathBuf::from("/tmp/app.sock.lock"));
	}

	#[test]
	fn lock_of_dead_process_is_stale() {
		let dir = std::env::temp_dir().join(format!("reactorlane-lock-{}", std::process::id()));
		fs::create_dir_all(&dir).unwrap();
		let socket = dir.join("s.sock");
		let lock = lock_file_for(&socket);
		fs::write(&socket, b"").unwrap();
		// pid_max is far below this on Linux
		fs::write(&lock, b"2147483000").unwrap();

		check_lock(&lock, &socket, "s.sock").unwrap();
		assert!(!socket.exists());
		assert!(!lock.exists());

		fs::write(&lock, std::process::id().to_string()).unwrap();
		let err = check_lock(&lock, &socket, "s.sock").unwrap_err();
		assert!(matches!(err, CannotListenError::Locked { .. }));
		fs::remove_dir_all(&dir).unwrap();
	}
}
