use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::connector::Connector;
use super::{Connection, Side};
use crate::addr::{Address, Domain, SockAddr, SocketKind};
use crate::config::ConnectConfig;
use crate::error::{CloseReason, ConnectError, SocketError};
use crate::handle::Handle;
use crate::reactor::{DelayedCall, Reactor, Selectable, call_soon};
use crate::socket::{ConnectStatus, PendingConnect, RawSocket, Stream};

/// Where a client connects to.
pub enum Target<D: Domain> {
	/// A ready-made socket address; no resolution step.
	Addr(D::Addr),
	/// A host name or IP literal, resolved through the reactor.
	Host { host: String, port: u16 },
}

impl<D: Domain> Clone for Target<D> {
	fn clone(&self) -> Self {
		match self {
			Target::Addr(addr) => Target::Addr(addr.clone()),
			Target::Host { host, port } => Target::Host {
				host: host.clone(),
				port: *port,
			},
		}
	}
}

impl<D: Domain> Target<D> {
	/// The target as an [`Address`]; unresolved names stay names.
	pub fn to_address(&self) -> Address {
		match self {
			Target::Addr(addr) => addr.to_address(SocketKind::Tcp),
			Target::Host { host, port } => match host.parse::<IpAddr>() {
				Ok(ip) => Address::Inet {
					kind: SocketKind::Tcp,
					ip,
					port: *port,
				},
				Err(_) => Address::Named {
					kind: SocketKind::Tcp,
					host: host.clone(),
					port: *port,
				},
			},
		}
	}
}

/// Progress of one outbound attempt.
///
/// ```text
/// Unconnected ──▶ Resolving ──▶ Connecting ──▶ Connected
///      │              │              │
///      └──────────────┴──────────────┴──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
	Unconnected,
	Resolving,
	Connecting,
	Connected,
	Failed,
}

enum ClientSocket<D: Domain> {
	Fresh(RawSocket<D, Stream>),
	Pending(PendingConnect<D>),
}

enum Probe<D: Domain> {
	Wait(PendingConnect<D>),
	Done(PendingConnect<D>),
	/// The pending socket comes back so it is unregistered before closing.
	Failed(ConnectError, Option<PendingConnect<D>>),
}

/// One outbound stream connection attempt.
///
/// Lives only until the connect completes; the resulting [`Connection`]
/// takes over the descriptor.
pub struct Client<D: Domain> {
	this: Weak<Self>,
	reactor: Rc<dyn Reactor>,
	connector: Weak<Connector<D>>,
	target: Target<D>,
	config: ConnectConfig<D>,
	handle: Handle,
	state: Cell<ClientState>,
	socket: RefCell<Option<ClientSocket<D>>>,
	address: RefCell<Option<D::Addr>>,
	start_call: Cell<Option<DelayedCall>>,
	connection: RefCell<Weak<Connection<D>>>,
}

impl<D: Domain> Client<D> {
	/// Creates the socket (binding it if asked) and schedules resolution
	/// for the next turn. Setup failures are reported to the connector on
	/// that turn too.
	pub(crate) fn new(
		reactor: Rc<dyn Reactor>,
		connector: Weak<Connector<D>>,
		target: Target<D>,
		config: ConnectConfig<D>,
	) -> Rc<Self> {
		let client = Rc::new_cyclic(|this: &Weak<Self>| {
			let owner: Weak<dyn Selectable> = this.clone();
			Self {
				this: this.clone(),
				handle: Handle::new(reactor.clone(), -1, owner),
				reactor,
				connector,
				target,
				config,
				state: Cell::new(ClientState::Unconnected),
				socket: RefCell::new(None),
				address: RefCell::new(None),
				start_call: Cell::new(None),
				connection: RefCell::new(Weak::new()),
			}
		});

		let this = client.this.clone();
		let call = match client.prepare() {
			Ok(()) => call_soon(&client.reactor, move || {
				if let Some(client) = this.upgrade() {
					client.start_call.set(None);
					client.resolve_address();
				}
			}),
			Err(err) => call_soon(&client.reactor, move || {
				if let Some(client) = this.upgrade() {
					client.start_call.set(None);
					client.fail_if_not_connected(err);
				}
			}),
		};
		client.start_call.set(Some(call));
		client
	}

	pub fn state(&self) -> ClientState {
		self.state.get()
	}

	/// The connection, once established and until it is gone.
	pub fn connection(&self) -> Option<Rc<Connection<D>>> {
		self.connection.borrow().upgrade()
	}

	pub fn target(&self) -> &Target<D> {
		&self.target
	}

	fn is_unix(&self) -> bool {
		matches!(self.target.to_address(), Address::Unix { .. })
	}

	fn prepare(&self) -> Result<(), ConnectError> {
		if let Address::Unix { path: Some(path) } = self.target.to_address() {
			let meta = std::fs::metadata(&path).map_err(|_| ConnectError::BadFile {
				reason: "No such file or directory",
			})?;
			if !meta.file_type().is_socket() {
				return Err(ConnectError::BadFile {
					reason: "File is not a socket",
				});
			}
		}

		let socket = RawSocket::<D, Stream>::new().map_err(|e| ConnectError::Os { errno: e.errno() })?;
		let is_unix = self.is_unix();
		self.config
			.tcp
			.apply(&socket, is_unix)
			.and_then(|()| self.config.buffers.apply(&socket))
			.map_err(|e| ConnectError::Os { errno: e.errno() })?;

		if let Some(bind) = &self.config.bind {
			socket.bind_local(bind).map_err(|e| ConnectError::Bind {
				errno: e.errno(),
				addr: bind.to_string(),
			})?;
		}

		self.handle.attach(socket.as_raw_fd());
		*self.socket.borrow_mut() = Some(ClientSocket::Fresh(socket));
		Ok(())
	}

	fn resolve_address(&self) {
		if self.state.get() != ClientState::Unconnected {
			return;
		}
		match &self.target {
			Target::Addr(addr) => self.set_real_address(addr.clone()),
			Target::Host { host, port } => {
				if let Ok(ip) = host.parse::<IpAddr>() {
					self.resolved(host.clone(), *port, Some(ip));
					return;
				}
				self.state.set(ClientState::Resolving);
				debug!(host = %host, "resolving");
				let this = self.this.clone();
				let (name, port) = (host.clone(), *port);
				self.reactor.resolve(
					host,
					Box::new(move |ip| {
						if let Some(client) = this.upgrade() {
							client.resolved(name, port, ip);
						}
					}),
				);
			}
		}
	}

	fn resolved(&self, host: String, port: u16, ip: Option<IpAddr>) {
		if !matches!(self.state.get(), ClientState::Unconnected | ClientState::Resolving) {
			return;
		}
		match ip.and_then(|ip| D::from_ip(ip, port)) {
			Some(addr) => self.set_real_address(addr),
			None => self.fail_if_not_connected(ConnectError::UnknownHost { host }),
		}
	}

	fn set_real_address(&self, addr: D::Addr) {
		*self.address.borrow_mut() = Some(addr);
		self.state.set(ClientState::Connecting);
		self.do_connect();
	}

	/// Issues or re-checks the non-blocking connect.
	fn do_connect(&self) {
		if self.state.get() != ClientState::Connecting {
			return;
		}
		let Some(addr) = self.address.borrow().clone() else {
			return;
		};
		let Some(socket) = self.socket.borrow_mut().take() else {
			return;
		};

		match Self::probe(socket, &addr) {
			Probe::Wait(pending) => {
				*self.socket.borrow_mut() = Some(ClientSocket::Pending(pending));
				self.handle.start_reading();
				self.handle.start_writing();
			}
			Probe::Done(pending) => self.connected(pending, addr),
			Probe::Failed(err, pending) => {
				*self.socket.borrow_mut() = pending.map(ClientSocket::Pending);
				self.fail_if_not_connected(err);
			}
		}
	}

	fn probe(socket: ClientSocket<D>, addr: &D::Addr) -> Probe<D> {
		let connect_err = |e: SocketError| ConnectError::from_errno(e.errno());
		match socket {
			ClientSocket::Fresh(raw) => match raw.connect_nonblocking(addr) {
				Ok((pending, ConnectStatus::Connected)) => Probe::Done(pending),
				Ok((pending, ConnectStatus::InProgress)) => Probe::Wait(pending),
				// never registered, so closing here is safe
				Err(e) => Probe::Failed(connect_err(e), None),
			},
			ClientSocket::Pending(pending) => {
				match pending.take_error() {
					Ok(Some(errno)) => return Probe::Failed(ConnectError::from_errno(errno), Some(pending)),
					Ok(None) => {}
					Err(e) => return Probe::Failed(connect_err(e), Some(pending)),
				}
				match pending.poll_connect(addr) {
					Ok(ConnectStatus::Connected) => Probe::Done(pending),
					Ok(ConnectStatus::InProgress) => Probe::Wait(pending),
					Err(e) => Probe::Failed(connect_err(e), Some(pending)),
				}
			}
		}
	}

	fn connected(&self, pending: PendingConnect<D>, addr: D::Addr) {
		self.handle.stop_reading();
		self.handle.stop_writing();

		let stream = pending.finish();
		let host = match stream.local_addr() {
			Ok(local) => local.to_address(SocketKind::Tcp),
			Err(e) => {
				drop(stream);
				self.fail_if_not_connected(ConnectError::Os { errno: e.errno() });
				return;
			}
		};
		let peer = addr.to_address(SocketKind::Tcp);

		let Some(connector) = self.connector.upgrade() else {
			self.state.set(ClientState::Failed);
			self.handle.mark_closed();
			return;
		};
		let Some(protocol) = connector.build_protocol(&peer) else {
			drop(stream);
			self.fail_if_not_connected(ConnectError::NoProtocol);
			return;
		};

		self.state.set(ClientState::Connected);
		self.handle.mark_closed();
		debug!(peer = %peer, "connected");

		let prefix = format!("{},client", connector.factory_prefix());
		let conn = Connection::new(
			self.reactor.clone(),
			stream,
			protocol,
			prefix,
			host,
			peer,
			Side::Client {
				connector: Rc::downgrade(&connector),
			},
			self.config.read_size,
		);
		*self.connection.borrow_mut() = Rc::downgrade(&conn);
		conn.start();
	}

	/// Ends the attempt with `err` unless it already finished. Reports to
	/// the connector, never to a protocol.
	pub(crate) fn fail_if_not_connected(&self, err: ConnectError) {
		if matches!(self.state.get(), ClientState::Connected | ClientState::Failed) {
			return;
		}
		self.state.set(ClientState::Failed);
		if let Some(call) = self.start_call.take() {
			self.reactor.cancel_call(call);
		}
		self.handle.mark_closed();
		drop(self.socket.borrow_mut().take());
		debug!(error = %err, "connect failed");

		if let Some(connector) = self.connector.upgrade() {
			connector.connection_failed(err);
		}
	}

	/// Cancels the attempt with `ConnectError::Cancelled`.
	pub fn stop_connecting(&self) {
		self.fail_if_not_connected(ConnectError::Cancelled);
	}
}

impl<D: Domain> Selectable for Client<D> {
	fn fileno(&self) -> RawFd {
		self.handle.fileno()
	}

	fn do_read(&self) {
		self.do_connect();
	}

	fn do_write(&self) {
		self.do_connect();
	}

	fn connection_lost(&self, reason: CloseReason) {
		let errno = match reason {
			CloseReason::Lost { errno: Some(errno) } => errno,
			_ => libc::ECONNABORTED,
		};
		self.fail_if_not_connected(ConnectError::from_errno(errno));
	}

	fn log_prefix(&self) -> String {
		String::from("Uninitialized")
	}
}
