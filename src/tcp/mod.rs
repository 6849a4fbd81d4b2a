//! Stream transports: connected TCP/UNIX connections, the client connect
//! state machine, outbound connectors, listening ports and the TLS
//! strategy.

mod client;
mod connector;
mod port;
mod tls;

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use tracing::{debug, error};

use crate::addr::{Address, Domain};
use crate::error::{CloseReason, TransportError};
use crate::handle::{Handle, IoStrategy, PlainIo, ReadProgress, WriteProgress, WriteQueue};
use crate::protocol::{Protocol, Transport};
use crate::reactor::{Reactor, Selectable, call_soon};
use crate::socket::ConnectedStream;

pub use self::client::{Client, ClientState, Target};
pub use self::connector::{Connector, ConnectorState};
pub use self::port::{AcceptBudget, Port};
pub use self::tls::TlsContext;

use self::tls::TlsStrategy;

/// Upper bound on back-to-back reads of already decrypted data in one
/// readiness event.
const MAX_BUFFERED_READS: usize = 16;

/// Which end created the connection.
pub enum Side<D: Domain> {
	/// Accepted by a `Port`; `session` counts up per port.
	Server { session: u64 },
	/// Made by a `Connector`, which hears about the loss.
	Client { connector: Weak<Connector<D>> },
}

enum TlsState {
	Plain,
	/// `start_tls` was called with bytes still queued. Later writes wait in
	/// `backlog` until the upgrade happens.
	Waiting {
		conn: rustls::Connection,
		backlog: WriteQueue,
		close_after: bool,
	},
	Active,
}

/// A connected stream transport, shared by server and client ends.
pub struct Connection<D: Domain> {
	this: Weak<Self>,
	handle: Handle,
	socket: RefCell<Option<ConnectedStream<D>>>,
	strategy: RefCell<Box<dyn IoStrategy>>,
	tls: RefCell<TlsState>,
	protocol: RefCell<Option<Box<dyn Protocol>>>,
	prefix: String,
	host: Address,
	peer: Address,
	side: Side<D>,
	read_buf: RefCell<Vec<u8>>,
	paused: Cell<bool>,
}

impl<D: Domain> Connection<D> {
	/// Wraps an established stream. Nothing is registered until `start`.
	pub(crate) fn new(
		reactor: Rc<dyn Reactor>,
		stream: ConnectedStream<D>,
		protocol: Box<dyn Protocol>,
		prefix: String,
		host: Address,
		peer: Address,
		side: Side<D>,
		read_size: usize,
	) -> Rc<Self> {
		let fd = stream.as_raw_fd();
		Rc::new_cyclic(|this: &Weak<Self>| {
			let owner: Weak<dyn Selectable> = this.clone();
			Self {
				this: this.clone(),
				handle: Handle::new(reactor, fd, owner),
				socket: RefCell::new(Some(stream)),
				strategy: RefCell::new(Box::new(PlainIo)),
				tls: RefCell::new(TlsState::Plain),
				protocol: RefCell::new(Some(protocol)),
				prefix,
				host,
				peer,
				side,
				read_buf: RefCell::new(vec![0; read_size.max(1)]),
				paused: Cell::new(false),
			}
		})
	}

	/// Marks the connection live, introduces it to its protocol and starts
	/// reading.
	pub(crate) fn start(self: &Rc<Self>) {
		self.handle.set_connected();
		let transport: Rc<dyn Transport> = self.clone();
		if let Some(protocol) = self.protocol.borrow_mut().as_mut() {
			protocol.make_connection(transport);
		}
		if !self.handle.is_disconnecting() && !self.paused.get() {
			self.handle.start_reading();
		}
	}

	pub fn session(&self) -> Option<u64> {
		match self.side {
			Side::Server { session } => Some(session),
			Side::Client { .. } => None,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.handle.is_connected()
	}

	pub fn is_closed(&self) -> bool {
		self.handle.is_disconnected()
	}

	pub fn is_reading(&self) -> bool {
		self.handle.is_reading()
	}

	pub fn is_writing(&self) -> bool {
		self.handle.is_writing()
	}

	pub fn is_tls(&self) -> bool {
		matches!(*self.tls.borrow(), TlsState::Active)
	}

	/// Bytes waiting to be sent.
	pub fn pending_bytes(&self) -> usize {
		self.handle.queued_len()
	}

	fn deliver(&self, data: &[u8]) {
		match self.protocol.try_borrow_mut() {
			Ok(mut slot) => {
				if let Some(protocol) = slot.as_mut() {
					protocol.data_received(data);
				}
			}
			Err(_) => error!(prefix = %self.prefix, len = data.len(), "protocol busy, dropping re-entrant read"),
		}
	}

	fn read_eof(&self) {
		let keep_writing = match self.protocol.try_borrow_mut() {
			Ok(mut slot) => slot.as_mut().is_some_and(|p| p.read_connection_lost()),
			Err(_) => false,
		};
		if !keep_writing {
			self.teardown(CloseReason::Done);
			return;
		}
		self.handle.mark_read_closed();
		if self.handle.is_write_disconnected() {
			self.teardown(CloseReason::Done);
		}
	}

	fn write_closed(&self) {
		if let Ok(mut slot) = self.protocol.try_borrow_mut() {
			if let Some(protocol) = slot.as_mut() {
				protocol.write_connection_lost();
			}
		}
		if self.handle.is_read_closed() {
			self.teardown(CloseReason::Done);
		}
	}

	/// Swaps in the TLS strategy once nothing plaintext is left to send.
	fn maybe_activate_tls(&self) {
		let drained = self.handle.queue_is_empty() && !self.strategy.borrow().has_buffered_output();
		if !drained || !matches!(*self.tls.borrow(), TlsState::Waiting { .. }) {
			return;
		}
		let TlsState::Waiting { conn, mut backlog, close_after } = self.tls.replace(TlsState::Active) else {
			return;
		};
		self.activate_tls(conn);
		for chunk in backlog.drain_chunks() {
			self.handle.write(&chunk);
		}
		if close_after {
			self.handle.lose_connection();
		}
	}

	fn activate_tls(&self, conn: rustls::Connection) {
		debug!(prefix = %self.prefix, client = matches!(conn, rustls::Connection::Client(_)), "starting TLS");
		let mut strategy = self.strategy.borrow_mut();
		*strategy = Box::new(TlsStrategy::new(conn));
		self.handle.sync_strategy_interest(&**strategy);
	}

	/// Terminal teardown: unregister, close the descriptor, then tell the
	/// protocol and (for clients) the connector. Runs once.
	fn teardown(&self, reason: CloseReason) {
		if !self.handle.mark_closed() {
			return;
		}
		drop(self.socket.borrow_mut().take());
		debug!(prefix = %self.prefix, reason = %reason, "connection lost");
		self.notify_lost(reason);
	}

	fn notify_lost(&self, reason: CloseReason) {
		let protocol = match self.protocol.try_borrow_mut() {
			Ok(mut slot) => slot.take(),
			Err(_) => {
				// still inside a protocol callback further up the stack
				let this = self.this.clone();
				call_soon(self.handle.reactor(), move || {
					if let Some(this) = this.upgrade() {
						this.notify_lost(reason);
					}
				});
				return;
			}
		};
		if let Some(mut protocol) = protocol {
			protocol.connection_lost(reason.clone());
		}
		if let Side::Client { connector } = &self.side {
			if let Some(connector) = connector.upgrade() {
				connector.connection_lost(reason);
			}
		}
	}
}

impl<D: Domain> Selectable for Connection<D> {
	fn fileno(&self) -> RawFd {
		self.handle.fileno()
	}

	fn do_read(&self) {
		for _ in 0..MAX_BUFFERED_READS {
			if self.handle.is_disconnected() {
				return;
			}
			let mut buf = std::mem::take(&mut *self.read_buf.borrow_mut());
			let progress = {
				let mut socket = self.socket.borrow_mut();
				let Some(stream) = socket.as_mut() else { return };
				let mut strategy = self.strategy.borrow_mut();
				self.handle.read(&mut **strategy, stream, &mut buf)
			};
			match progress {
				ReadProgress::Data(n) => self.deliver(&buf[..n]),
				ReadProgress::Nothing => {}
				ReadProgress::Eof => {
					*self.read_buf.borrow_mut() = buf;
					self.read_eof();
					return;
				}
				ReadProgress::Closed(reason) => {
					*self.read_buf.borrow_mut() = buf;
					self.teardown(reason);
					return;
				}
			}
			*self.read_buf.borrow_mut() = buf;
			if self.paused.get() || !self.strategy.borrow().has_buffered_input() {
				return;
			}
		}
	}

	fn do_write(&self) {
		if self.handle.is_disconnected() {
			return;
		}
		let progress = {
			let mut socket = self.socket.borrow_mut();
			let Some(stream) = socket.as_mut() else { return };
			let mut strategy = self.strategy.borrow_mut();
			self.handle.flush(&mut **strategy, stream)
		};
		match progress {
			WriteProgress::Pending => {}
			WriteProgress::Idle => self.maybe_activate_tls(),
			WriteProgress::WriteClosed => self.write_closed(),
			WriteProgress::Closed(reason) => self.teardown(reason),
		}
	}

	fn connection_lost(&self, reason: CloseReason) {
		self.teardown(reason);
	}

	fn log_prefix(&self) -> String {
		self.prefix.clone()
	}
}

impl<D: Domain> Transport for Connection<D> {
	fn write(&self, data: &[u8]) {
		if let TlsState::Waiting { backlog, .. } = &mut *self.tls.borrow_mut() {
			if self.handle.accepts_writes() {
				backlog.push(data);
			}
			return;
		}
		self.handle.write(data);
	}

	fn lose_connection(&self) {
		if let TlsState::Waiting { close_after, .. } = &mut *self.tls.borrow_mut() {
			*close_after = true;
			return;
		}
		self.handle.lose_connection();
	}

	fn abort_connection(&self) {
		if let TlsState::Waiting { backlog, .. } = &mut *self.tls.borrow_mut() {
			backlog.clear();
		}
		self.handle.abort();
	}

	fn lose_write_connection(&self) {
		self.handle.lose_write_connection();
	}

	fn pause_producing(&self) {
		self.paused.set(true);
		self.handle.stop_reading();
	}

	fn resume_producing(&self) {
		self.paused.set(false);
		if self.handle.is_connected() && !self.handle.is_disconnecting() {
			self.handle.start_reading();
		}
	}

	fn start_tls(&self, context: TlsContext) -> Result<(), TransportError> {
		if !self.handle.is_connected() || self.handle.is_disconnecting() {
			return Err(TransportError::NotConnected);
		}
		if !matches!(*self.tls.borrow(), TlsState::Plain) {
			return Err(TransportError::TlsAlreadyStarted);
		}
		let client = context.is_client();
		let conn = context.into_connection()?;

		let drained = self.handle.queue_is_empty() && !self.strategy.borrow().has_buffered_output();
		if drained {
			*self.tls.borrow_mut() = TlsState::Active;
			self.activate_tls(conn);
		} else {
			debug!(prefix = %self.prefix, client, queued = self.handle.queued_len(), "TLS waits for queue to drain");
			*self.tls.borrow_mut() = TlsState::Waiting {
				conn,
				backlog: WriteQueue::default(),
				close_after: false,
			};
		}
		Ok(())
	}

	fn get_host(&self) -> Address {
		self.host.clone()
	}

	fn get_peer(&self) -> Address {
		self.peer.clone()
	}

	fn log_prefix(&self) -> String {
		self.prefix.clone()
	}
}
