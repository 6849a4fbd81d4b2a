use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::error::{CloseReason, TransportError};
use crate::handle::{Interest, IoOutcome, IoStrategy, RawIo};

/// Which side of the handshake this connection plays, and with what
/// configuration.
#[derive(Clone)]
pub enum TlsContext {
	Client {
		config: Arc<ClientConfig>,
		server_name: ServerName<'static>,
	},
	Server(Arc<ServerConfig>),
}

impl TlsContext {
	/// Client context verifying the peer as `server_name` (DNS name or IP).
	pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TransportError> {
		let server_name = ServerName::try_from(server_name.to_owned()).map_err(|e| TransportError::Tls {
			message: e.to_string(),
		})?;
		Ok(TlsContext::Client { config, server_name })
	}

	pub fn server(config: Arc<ServerConfig>) -> Self {
		TlsContext::Server(config)
	}

	pub(crate) fn into_connection(self) -> Result<rustls::Connection, TransportError> {
		let tls_err = |e: rustls::Error| TransportError::Tls { message: e.to_string() };
		Ok(match self {
			TlsContext::Client { config, server_name } => {
				rustls::Connection::Client(ClientConnection::new(config, server_name).map_err(tls_err)?)
			}
			TlsContext::Server(config) => rustls::Connection::Server(ServerConnection::new(config).map_err(tls_err)?),
		})
	}

	pub(crate) fn is_client(&self) -> bool {
		matches!(self, TlsContext::Client { .. })
	}
}

/// Lets rustls drive a `dyn RawIo` through plain `Read`/`Write`.
struct Wire<'a>(&'a mut dyn RawIo);

impl Read for Wire<'_> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.0.read(buf)
	}
}

impl Write for Wire<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.0.flush()
	}
}

/// Plaintext in, records out.
///
/// Sits where `PlainIo` used to, so the owning connection and its protocol
/// keep the same identity across the upgrade.
pub(crate) struct TlsStrategy {
	conn: rustls::Connection,
	plaintext_pending: usize,
	/// Plaintext was accepted before the handshake finished; rustls holds
	/// it until the session keys exist.
	held_plaintext: bool,
	close_sent: bool,
}

impl TlsStrategy {
	pub(crate) fn new(conn: rustls::Connection) -> Self {
		Self {
			conn,
			plaintext_pending: 0,
			held_plaintext: false,
			close_sent: false,
		}
	}

	fn read_plaintext(&mut self, buf: &mut [u8]) -> Option<IoOutcome> {
		match self.conn.reader().read(buf) {
			// close_notify received and everything before it consumed
			Ok(0) => Some(IoOutcome::Complete(0)),
			Ok(n) => {
				self.plaintext_pending = self.plaintext_pending.saturating_sub(n);
				Some(IoOutcome::Complete(n))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
			// transport EOF without close_notify
			Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Some(IoOutcome::Fatal(CloseReason::Lost { errno: None })),
			Err(e) => Some(IoOutcome::Fatal(CloseReason::from_io(&e))),
		}
	}

	fn push_records(&mut self, io: &mut dyn RawIo) -> IoOutcome {
		let mut total = 0;
		while self.conn.wants_write() {
			match self.conn.write_tls(&mut Wire(&mut *io)) {
				Ok(0) => break,
				Ok(n) => total += n,
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
					return IoOutcome::WouldBlock(Interest::Write);
				}
				Err(e) => return IoOutcome::Fatal(CloseReason::from_io(&e)),
			}
		}
		IoOutcome::Complete(total)
	}
}

impl IoStrategy for TlsStrategy {
	fn read_some(&mut self, io: &mut dyn RawIo, buf: &mut [u8]) -> IoOutcome {
		if let Some(outcome) = self.read_plaintext(buf) {
			return outcome;
		}

		match self.conn.read_tls(&mut Wire(&mut *io)) {
			Ok(_) => {}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
				return IoOutcome::WouldBlock(Interest::Read);
			}
			Err(e) => return IoOutcome::Fatal(CloseReason::from_io(&e)),
		}

		match self.conn.process_new_packets() {
			Ok(state) => self.plaintext_pending = state.plaintext_bytes_to_read(),
			Err(e) => {
				// best effort: let the peer see our alert
				let _ = self.push_records(io);
				return IoOutcome::Fatal(CloseReason::Tls { message: e.to_string() });
			}
		}

		// Handshake replies go out now; if the socket is full they stay
		// buffered and the handle arms write readiness.
		let pushed = self.push_records(io);
		if let IoOutcome::Fatal(reason) = pushed {
			return IoOutcome::Fatal(reason);
		}

		match self.read_plaintext(buf) {
			Some(outcome) => outcome,
			None if pushed == IoOutcome::WouldBlock(Interest::Write) => IoOutcome::WouldBlock(Interest::Write),
			None => IoOutcome::WouldBlock(Interest::Read),
		}
	}

	fn write_some(&mut self, io: &mut dyn RawIo, data: &[u8]) -> IoOutcome {
		let accepted = match self.conn.writer().write(data) {
			Ok(n) => n,
			Err(e) => return IoOutcome::Fatal(CloseReason::from_io(&e)),
		};

		if let IoOutcome::Fatal(reason) = self.push_records(io) {
			return IoOutcome::Fatal(reason);
		}

		if accepted == 0 {
			// Buffer limit reached. Before the handshake completes only the
			// peer can unblock us.
			let wait = if self.conn.is_handshaking() { Interest::Read } else { Interest::Write };
			return IoOutcome::WouldBlock(wait);
		}
		if self.conn.is_handshaking() {
			self.held_plaintext = true;
		}
		IoOutcome::Complete(accepted)
	}

	fn has_buffered_output(&self) -> bool {
		self.conn.wants_write()
	}

	fn flush(&mut self, io: &mut dyn RawIo) -> IoOutcome {
		self.push_records(io)
	}

	fn has_buffered_input(&self) -> bool {
		self.plaintext_pending > 0
	}

	fn wants_read(&self) -> bool {
		self.conn.is_handshaking()
	}

	fn shutdown(&mut self, io: &mut dyn RawIo) -> IoOutcome {
		if self.conn.is_handshaking() && self.held_plaintext {
			// close_notify must follow the held bytes, which need the peer's
			// half of the handshake first
			return match self.push_records(io) {
				IoOutcome::Complete(_) => IoOutcome::WouldBlock(Interest::Read),
				other => other,
			};
		}
		if !self.close_sent {
			self.close_sent = true;
			self.conn.send_close_notify();
		}
		match self.push_records(io) {
			IoOutcome::Complete(_) if self.conn.wants_write() => IoOutcome::WouldBlock(Interest::Write),
			other => other,
		}
	}

	fn name(&self) -> &'static str {
		"tls"
	}
}
