//! Callback interfaces between transports and application code.
//!
//! Transports call protocols; protocols drive transports through the
//! `*Transport` traits they are handed in `make_connection`.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::addr::Address;
use crate::deferred::Deferred;
use crate::error::{CloseReason, ConnectError, DatagramError, TransportError};
use crate::process::{ProcessEnded, Signal};
use crate::reactor::{Reactor, call_soon};
use crate::tcp::TlsContext;

/// The stream transport as a protocol sees it.
pub trait Transport {
	/// Queues bytes for sending. Never blocks; ignored once closing.
	fn write(&self, data: &[u8]);

	fn write_sequence(&self, chunks: &[&[u8]]) {
		for chunk in chunks {
			self.write(chunk);
		}
	}

	/// Flushes what is queued, then closes.
	fn lose_connection(&self);

	/// Drops the queue and closes on the next reactor turn.
	fn abort_connection(&self);

	/// Flushes what is queued, then shuts down the write half only.
	fn lose_write_connection(&self);

	fn pause_producing(&self);
	fn resume_producing(&self);

	/// Switches the connection to TLS, once, after the pending queue drains.
	fn start_tls(&self, context: TlsContext) -> Result<(), TransportError>;

	fn get_host(&self) -> Address;
	fn get_peer(&self) -> Address;
	fn log_prefix(&self) -> String;
}

/// Application handler bound to one stream transport.
pub trait Protocol {
	fn make_connection(&mut self, transport: Rc<dyn Transport>);

	fn data_received(&mut self, data: &[u8]);

	/// Peer shut down its write half. Return `true` to keep the connection
	/// open for writing; the default closes it.
	fn read_connection_lost(&mut self) -> bool {
		false
	}

	/// Our write half was shut down after `lose_write_connection`.
	fn write_connection_lost(&mut self) {}

	/// Called exactly once, when the transport is gone.
	fn connection_lost(&mut self, reason: CloseReason);
}

/// Builds protocols for new connections and hears about listener lifetime.
pub trait Factory {
	/// Called when a port starts listening with this factory, or a
	/// connector starts its first attempt. Each port or connector calls it
	/// once per active period.
	fn do_start(&mut self) {}

	/// Called when that port stops listening, or that connector goes idle
	/// after a failure or a lost connection.
	fn do_stop(&mut self) {}

	/// A protocol for the peer at `addr`, or `None` to refuse it.
	fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>>;

	/// Tag for log lines and connection prefixes.
	fn log_prefix(&self) -> String {
		String::from("Factory")
	}
}

/// The control surface a connector exposes to its factory.
pub trait ConnectorControl {
	fn connect(&self) -> Result<(), TransportError>;
	fn stop_connecting(&self) -> Result<(), TransportError>;
	fn disconnect(&self);
	fn destination(&self) -> Address;
}

/// A factory used for outbound connections.
pub trait ClientFactory: Factory {
	fn started_connecting(&mut self, _connector: &dyn ConnectorControl) {}

	fn client_connection_failed(&mut self, connector: &dyn ConnectorControl, reason: ConnectError);

	fn client_connection_lost(&mut self, connector: &dyn ConnectorControl, reason: CloseReason);
}

/// The datagram transport as a protocol sees it.
pub trait DatagramTransport {
	/// Sends one datagram. `addr` is required unless connected, and must be
	/// `None` or the peer when connected.
	fn write(&self, data: &[u8], addr: Option<&Address>) -> Result<usize, DatagramError>;

	/// Sends the concatenation of `chunks` as one datagram.
	fn write_sequence(&self, chunks: &[&[u8]], addr: Option<&Address>) -> Result<usize, DatagramError> {
		self.write(&chunks.concat(), addr)
	}

	/// Fixes the peer. `host` must be an IP literal.
	fn connect(&self, host: &str, port: u16) -> Result<(), DatagramError>;

	fn get_host(&self) -> Address;

	/// Stops reading and closes on the next turn.
	fn stop_listening(&self) -> Deferred<()>;

	fn lose_connection(&self) {
		self.stop_listening();
	}
}

/// Application handler bound to a datagram port.
pub trait DatagramProtocol {
	fn make_connection(&mut self, _transport: Rc<dyn DatagramTransport>) {}

	fn do_start(&mut self) {}

	fn do_stop(&mut self) {}

	/// One datagram. `addr` is `None` in connected mode.
	fn datagram_received(&mut self, data: &[u8], addr: Option<&Address>);

	/// The connected peer answered with ICMP port unreachable.
	fn connection_refused(&mut self) {}
}

/// The process transport as a protocol sees it.
pub trait ProcessTransport {
	/// Queues bytes for child descriptor `child_fd`. Ignored unless that
	/// descriptor is a pipe towards the child.
	fn write_to_child(&self, child_fd: RawFd, data: &[u8]);

	/// Closes the parent's end of child descriptor `child_fd`, flushing
	/// first if the parent writes to it.
	fn close_child_fd(&self, child_fd: RawFd);

	/// Queues bytes for the child's stdin.
	fn write(&self, data: &[u8]) {
		self.write_to_child(0, data);
	}

	fn write_sequence(&self, chunks: &[&[u8]]) {
		for chunk in chunks {
			self.write(chunk);
		}
	}

	fn close_stdin(&self) {
		self.close_child_fd(0);
	}

	fn close_stdout(&self) {
		self.close_child_fd(1);
	}

	fn close_stderr(&self) {
		self.close_child_fd(2);
	}

	/// Closes every pipe.
	fn lose_connection(&self);

	fn signal_process(&self, signal: Signal) -> Result<(), TransportError>;

	/// Child pid, `None` once reaped.
	fn pid(&self) -> Option<i32>;
}

/// Application handler bound to a child process.
pub trait ProcessProtocol {
	fn make_connection(&mut self, _transport: Rc<dyn ProcessTransport>) {}

	fn out_received(&mut self, _data: &[u8]) {}

	fn err_received(&mut self, _data: &[u8]) {}

	fn in_connection_lost(&mut self) {}

	fn out_connection_lost(&mut self) {}

	fn err_connection_lost(&mut self) {}

	/// Output on any child descriptor the parent reads. Descriptors 1 and 2
	/// go to `out_received` and `err_received` unless overridden.
	fn child_data_received(&mut self, child_fd: RawFd, data: &[u8]) {
		match child_fd {
			1 => self.out_received(data),
			2 => self.err_received(data),
			_ => {}
		}
	}

	/// The pipe behind `child_fd` closed. Descriptors 0, 1 and 2 go to the
	/// matching `*_connection_lost` unless overridden.
	fn child_connection_lost(&mut self, child_fd: RawFd) {
		match child_fd {
			0 => self.in_connection_lost(),
			1 => self.out_connection_lost(),
			2 => self.err_connection_lost(),
			_ => {}
		}
	}

	/// The child was reaped. Pipes may still be open.
	fn process_exited(&mut self, _status: ProcessEnded) {}

	/// Reaped and every pipe closed. Called exactly once.
	fn process_ended(&mut self, status: ProcessEnded);
}

/// Runs `f` against a shared factory, or on the next turn if the factory is
/// already borrowed further up the stack.
pub(crate) fn with_factory<F>(reactor: &Rc<dyn Reactor>, factory: &Rc<RefCell<F>>, f: impl FnOnce(&mut F) + 'static)
where
	F: ?Sized + 'static,
{
	match factory.try_borrow_mut() {
		Ok(mut guard) => f(&mut guard),
		Err(_) => {
			let factory = factory.clone();
			let retry = reactor.clone();
			call_soon(reactor, move || with_factory(&retry, &factory, f));
		}
	}
}
