use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::bound::BoundSocket;
use super::datagram::DatagramSocket;
use super::pending::{ConnectStatus, PendingConnect};
use super::{Datagram, SockType, Stream};
use crate::addr::{Domain, ToSockAddr};
use crate::error::{SocketError, errno};

/// A socket that has been created but not yet bound or connected.
///
/// This is the starting point for all socket operations.
/// Use `.bind()` to become a listener or datagram socket.
/// Use `.connect_nonblocking()` to start an outbound stream.
pub struct RawSocket<D: Domain, T: SockType> {
	fd: OwnedFd,
	_marker: PhantomData<(D, T)>,
}

impl<D: Domain, T: SockType> RawSocket<D, T> {
	/// Creates a new non-blocking, close-on-exec socket.
	pub fn new() -> Result<Self, SocketError> {
		let fd = unsafe {
			libc::socket(D::raw(), T::raw() | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0)
		};
		if fd == -1 {
			return Err(SocketError::Create { errno: errno() });
		}
		let fd = unsafe { OwnedFd::from_raw_fd(fd) };

		Ok(Self {
			fd,
			_marker: PhantomData,
		})
	}

	/// Binds without changing typestate. Used by clients that pin a local
	/// address before connecting.
	pub fn bind_local(&self, addr: &D::Addr) -> Result<(), SocketError> {
		bind_fd(self.fd.as_raw_fd(), addr)
	}

	/// Binds the socket to an address.
	///
	/// Consumes self, returns BoundSocket.
	pub fn bind(self, addr: &D::Addr) -> Result<BoundSocket<D, T>, SocketError> {
		self.bind_local(addr)?;
		Ok(BoundSocket::from_fd(self.fd))
	}
}

impl<D: Domain> RawSocket<D, Stream> {
	/// Starts a non-blocking connection.
	///
	/// `InProgress` means the caller must wait for write readiness and then
	/// probe the `PendingConnect`.
	pub fn connect_nonblocking(self, addr: &D::Addr) -> Result<(PendingConnect<D>, ConnectStatus), SocketError> {
		let pending = PendingConnect::from_fd(self.fd);
		let status = pending.poll_connect(addr)?;
		Ok((pending, status))
	}
}

impl<D: Domain> RawSocket<D, Datagram> {
	/// Binds a datagram socket to an address.
	pub fn bind_datagram(self, addr: &D::Addr) -> Result<DatagramSocket<D>, SocketError> {
		self.bind_local(addr)?;
		Ok(DatagramSocket::from_fd(self.fd))
	}
}

pub(crate) fn bind_fd<A: ToSockAddr + std::fmt::Display>(fd: RawFd, addr: &A) -> Result<(), SocketError> {
	let result = addr.with_raw(|ptr, len| unsafe { libc::bind(fd, ptr, len) });

	match result {
		Some(-1) => Err(SocketError::Bind {
			errno: errno(),
			addr: addr.to_string(),
		}),
		Some(_) => Ok(()),
		None => Err(SocketError::InvalidAddress {
			reason: "address too long",
		}),
	}
}

impl<D: Domain, T: SockType> AsRawFd for RawSocket<D, T> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl<D: Domain, T: SockType> AsFd for RawSocket<D, T> {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}
