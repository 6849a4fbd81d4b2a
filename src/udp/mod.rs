//! Datagram transports: a bound UDP (or UNIX datagram) port, with an
//! optional connected peer and IPv4 multicast controls.

mod multicast;

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use tracing::{debug, error, info};

use crate::addr::{Address, Domain, SockAddr, SocketKind};
use crate::config::DatagramConfig;
use crate::deferred::Deferred;
use crate::error::{CannotListenError, CloseReason, DatagramError, SocketError, errno_name};
use crate::handle::Handle;
use crate::protocol::{DatagramProtocol, DatagramTransport, with_factory};
use crate::reactor::{Reactor, Selectable};
use crate::socket::{Datagram, DatagramSocket, RawSocket};

pub use self::multicast::MulticastResult;

/// A bound datagram socket delivering one datagram per readiness event.
pub struct DatagramPort<D: Domain> {
	this: Weak<Self>,
	reactor: Rc<dyn Reactor>,
	handle: Handle,
	protocol: Rc<RefCell<dyn DatagramProtocol>>,
	addr: D::Addr,
	config: DatagramConfig,
	socket: RefCell<Option<DatagramSocket<D>>>,
	bound: RefCell<Option<D::Addr>>,
	peer: RefCell<Option<D::Addr>>,
	listening: Cell<bool>,
	stopped: RefCell<Option<Deferred<()>>>,
	read_buf: RefCell<Vec<u8>>,
	/// `(group, interface)` pairs joined through this port.
	memberships: RefCell<Vec<(Ipv4Addr, Ipv4Addr)>>,
}

impl<D: Domain> DatagramPort<D> {
	pub fn new(
		reactor: Rc<dyn Reactor>,
		addr: D::Addr,
		protocol: Rc<RefCell<dyn DatagramProtocol>>,
		config: DatagramConfig,
	) -> Rc<Self> {
		Rc::new_cyclic(|this: &Weak<Self>| {
			let owner: Weak<dyn Selectable> = this.clone();
			Self {
				this: this.clone(),
				handle: Handle::new(reactor.clone(), -1, owner),
				reactor,
				protocol,
				addr,
				read_buf: RefCell::new(vec![0; config.max_packet_size.max(1)]),
				config,
				socket: RefCell::new(None),
				bound: RefCell::new(None),
				peer: RefCell::new(None),
				listening: Cell::new(false),
				stopped: RefCell::new(None),
				memberships: RefCell::new(Vec::new()),
			}
		})
	}

	/// Creates a port and starts it.
	pub fn listen(
		reactor: Rc<dyn Reactor>,
		addr: D::Addr,
		protocol: Rc<RefCell<dyn DatagramProtocol>>,
		config: DatagramConfig,
	) -> Result<Rc<Self>, CannotListenError> {
		let port = Self::new(reactor, addr, protocol, config);
		port.start_listening()?;
		Ok(port)
	}

	/// Binds, hands the transport to the protocol and starts reading.
	pub fn start_listening(&self) -> Result<(), CannotListenError> {
		let where_ = self.addr.to_string();
		if self.listening.get() || self.handle.is_disconnected() {
			return Err(CannotListenError::AlreadyListening { addr: where_ });
		}

		let socket = RawSocket::<D, Datagram>::new().map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;
		self.config
			.apply(&socket)
			.map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;
		let socket = socket
			.bind_datagram(&self.addr)
			.map_err(|e| CannotListenError::from_socket(where_.clone(), e))?;

		*self.bound.borrow_mut() = socket.local_addr().ok();
		self.handle.attach(socket.as_raw_fd());
		*self.socket.borrow_mut() = Some(socket);
		self.handle.set_connected();
		self.listening.set(true);
		info!(prefix = %self.prefix(), addr = %self.get_host(), "starting on");

		let Some(this) = self.this.upgrade() else {
			return Ok(());
		};
		let transport: Rc<dyn DatagramTransport> = this;
		with_factory(&self.reactor, &self.protocol, move |protocol| {
			protocol.do_start();
			protocol.make_connection(transport);
		});
		self.handle.start_reading();
		Ok(())
	}

	fn prefix(&self) -> String {
		format!("{} (UDP)", self.addr)
	}

	pub fn local_addr(&self) -> Option<D::Addr> {
		self.bound.borrow().clone()
	}

	/// The connected peer, if `connect` was called.
	pub fn peer(&self) -> Option<D::Addr> {
		self.peer.borrow().clone()
	}

	pub fn is_listening(&self) -> bool {
		self.listening.get()
	}

	pub fn is_reading(&self) -> bool {
		self.handle.is_reading()
	}

	pub fn max_packet_size(&self) -> usize {
		self.config.max_packet_size
	}

	fn with_socket<T>(&self, f: impl FnOnce(&DatagramSocket<D>) -> Result<T, SocketError>) -> Result<T, DatagramError> {
		let socket = self.socket.borrow();
		let socket = socket.as_ref().ok_or(DatagramError::NotListening)?;
		f(socket).map_err(|e| DatagramError::Os { errno: e.errno() })
	}

	/// Runs one send, retrying when a signal interrupts it.
	fn send(&self, data: &[u8], to: Option<&D::Addr>) -> Result<usize, i32> {
		let socket = self.socket.borrow();
		let socket = socket.as_ref().ok_or(libc::EBADF)?;
		loop {
			let sent = match to {
				Some(addr) => socket.send_to(data, addr),
				None => socket.send(data),
			};
			match sent {
				Ok(n) => return Ok(n),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e.raw_os_error().unwrap_or(libc::EIO)),
			}
		}
	}

	fn deliver(&self, data: &[u8], from: Option<&Address>) {
		match self.protocol.try_borrow_mut() {
			Ok(mut protocol) => protocol.datagram_received(data, from),
			Err(_) => error!(prefix = %self.prefix(), len = data.len(), "protocol busy, dropping datagram"),
		}
	}

	fn close(&self, reason: CloseReason) {
		if !self.handle.mark_closed() {
			return;
		}
		self.listening.set(false);
		drop(self.socket.borrow_mut().take());
		self.memberships.borrow_mut().clear();
		info!(prefix = %self.prefix(), reason = %reason, "port closed");

		let stopped = self.stopped.borrow_mut().get_or_insert_with(Deferred::new).clone();
		with_factory(&self.reactor, &self.protocol, move |protocol| {
			protocol.do_stop();
			stopped.fire(());
		});
	}
}

impl<D: Domain> Selectable for DatagramPort<D> {
	fn fileno(&self) -> RawFd {
		self.handle.fileno()
	}

	fn do_read(&self) {
		let mut buf = std::mem::take(&mut *self.read_buf.borrow_mut());
		let received = match self.socket.borrow().as_ref() {
			Some(socket) => socket.recv_from(&mut buf),
			None => Err(io::Error::from_raw_os_error(libc::EBADF)),
		};
		match received {
			Ok((n, from)) => {
				if self.peer.borrow().is_some() {
					self.deliver(&buf[..n], None);
				} else {
					let from = from.to_address(SocketKind::Udp);
					self.deliver(&buf[..n], Some(&from));
				}
			}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
			Err(e) if e.raw_os_error() == Some(libc::ECONNREFUSED) => {
				if self.peer.borrow().is_some() {
					match self.protocol.try_borrow_mut() {
						Ok(mut protocol) => protocol.connection_refused(),
						Err(_) => error!(prefix = %self.prefix(), "protocol busy, dropping refusal"),
					}
				}
			}
			Err(e) => {
				let errno = e.raw_os_error().unwrap_or(libc::EIO);
				error!(prefix = %self.prefix(), errno = errno_name(errno), "recv failed");
			}
		}
		*self.read_buf.borrow_mut() = buf;
	}

	fn do_write(&self) {
		self.handle.stop_writing();
	}

	fn connection_lost(&self, reason: CloseReason) {
		self.close(reason);
	}

	fn log_prefix(&self) -> String {
		self.prefix()
	}
}

impl<D: Domain> DatagramTransport for DatagramPort<D> {
	fn write(&self, data: &[u8], addr: Option<&Address>) -> Result<usize, DatagramError> {
		if !self.listening.get() {
			return Err(DatagramError::NotListening);
		}
		if data.len() > self.config.max_packet_size {
			return Err(DatagramError::MessageTooLong { len: data.len() });
		}

		let peer = self.peer.borrow().clone();
		match peer {
			Some(peer) => {
				if let Some(addr) = addr {
					if *addr != peer.to_address(SocketKind::Udp) {
						return Err(DatagramError::AddressMismatch);
					}
				}
				self.send(data, None).map_err(|errno| DatagramError::from_errno(errno, data.len()))
			}
			None => {
				let addr = addr.ok_or(DatagramError::NoDestination)?;
				let to = D::Addr::from_address(addr).ok_or_else(|| DatagramError::NotAnAddress { host: addr.host() })?;
				match self.send(data, Some(&to)) {
					Ok(n) => Ok(n),
					// a stale ICMP error for some earlier destination
					Err(libc::ECONNREFUSED) => Ok(0),
					Err(errno) => Err(DatagramError::from_errno(errno, data.len())),
				}
			}
		}
	}

	fn connect(&self, host: &str, port: u16) -> Result<(), DatagramError> {
		if self.peer.borrow().is_some() {
			return Err(DatagramError::AlreadyConnected);
		}
		let not_an_address = || DatagramError::NotAnAddress { host: host.to_owned() };
		let ip: IpAddr = host.parse().map_err(|_| not_an_address())?;
		let addr = D::from_ip(ip, port).ok_or_else(not_an_address)?;

		self.with_socket(|socket| socket.connect(&addr))?;
		debug!(prefix = %self.prefix(), peer = %addr, "connected");
		*self.peer.borrow_mut() = Some(addr);
		Ok(())
	}

	fn get_host(&self) -> Address {
		match self.bound.borrow().as_ref() {
			Some(addr) => addr.to_address(SocketKind::Udp),
			None => self.addr.to_address(SocketKind::Udp),
		}
	}

	fn stop_listening(&self) -> Deferred<()> {
		if let Some(stopped) = self.stopped.borrow().as_ref() {
			return stopped.clone();
		}
		if !self.listening.get() {
			return Deferred::fired(());
		}
		let stopped = Deferred::new();
		*self.stopped.borrow_mut() = Some(stopped.clone());
		self.handle.stop_reading();
		self.handle.schedule_teardown(CloseReason::Done);
		stopped
	}
}
