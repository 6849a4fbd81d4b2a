use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::addr::Domain;
use crate::error::{SocketError, errno};
use crate::handle::RawIo;

/// A connected stream socket.
///
/// Represents an established connection, ready for reads and writes.
/// Created by `ListeningSocket::accept_nonblocking()` (server) or
/// `PendingConnect::finish()` (client).
pub struct ConnectedStream<D: Domain> {
	fd: OwnedFd,
	_marker: PhantomData<D>,
}

pub enum Shutdown {
	Read,      // SHUT_RD
	Write,     // SHUT_WR
	ReadWrite, // SHUT_RDWR
}

impl<D: Domain> ConnectedStream<D> {
	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self {
			fd,
			_marker: PhantomData,
		}
	}

	pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
		let n = unsafe {
			libc::recv(
				self.fd.as_raw_fd(),
				buf.as_mut_ptr() as *mut libc::c_void,
				buf.len(),
				0,
			)
		};

		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}

	/// `send(2)` with `MSG_NOSIGNAL`: a reset peer yields `EPIPE`, never SIGPIPE.
	pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe {
			libc::send(
				self.fd.as_raw_fd(),
				buf.as_ptr() as *const libc::c_void,
				buf.len(),
				libc::MSG_NOSIGNAL,
			)
		};

		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}

	pub fn shutdown(&self, how: Shutdown) -> Result<(), SocketError> {
		let how = match how {
			Shutdown::Read => libc::SHUT_RD,
			Shutdown::Write => libc::SHUT_WR,
			Shutdown::ReadWrite => libc::SHUT_RDWR,
		};

		let result = unsafe { libc::shutdown(self.fd.as_raw_fd(), how) };

		if result == -1 {
			Err(SocketError::SetOption { errno: errno(), option: "shutdown" })
		} else {
			Ok(())
		}
	}

	/// Returns the remote address of this connection.
	pub fn peer_addr(&self) -> Result<D::Addr, SocketError> {
		super::sockname(self.fd.as_raw_fd(), true)
	}

	/// Returns the local address of this connection.
	pub fn local_addr(&self) -> Result<D::Addr, SocketError> {
		super::sockname(self.fd.as_raw_fd(), false)
	}
}

impl<D: Domain> io::Read for ConnectedStream<D> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.recv(buf)
	}
}

impl<D: Domain> io::Write for ConnectedStream<D> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.send(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(()) // TCP doesn't at this level
	}
}

impl<D: Domain> RawIo for ConnectedStream<D> {
	fn shutdown_write(&mut self) -> io::Result<()> {
		self.shutdown(Shutdown::Write).map_err(io::Error::from)
	}
}

impl<D: Domain> AsRawFd for ConnectedStream<D> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl<D: Domain> AsFd for ConnectedStream<D> {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}
