use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::stream::ConnectedStream;
use crate::addr::{Domain, FromSockAddr};
use crate::error::{SocketError, errno};

/// A listening socket ready to accept connections.
///
/// Only exists for Stream sockets (datagram sockets cannot listen).
/// The type parameter D tracks which address family (Ipv4, Ipv6, Unix).
pub struct ListeningSocket<D: Domain> {
	fd: OwnedFd,
	_marker: PhantomData<D>,
}

/// Result of a non-blocking accept attempt.
///
/// This enum does **not** represent socket state.
/// It represents the **outcome of a syscall probe**.
pub enum AcceptResult<D: Domain> {
	/// A connection was accepted. The socket is connected but may not yet
	/// be readable.
	Connection(ConnectedStream<D>, D::Addr),

	/// No connection is ready at this time.
	WouldBlock,

	/// The accept syscall was interrupted by a signal. Safe to retry.
	Interrupted,
}

impl<D: Domain> ListeningSocket<D> {
	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self {
			fd,
			_marker: PhantomData,
		}
	}

	/// Attempts to accept a connection **without blocking**.
	///
	/// The accepted descriptor is itself non-blocking and close-on-exec.
	/// Errors keep their errno so the caller can tell resource exhaustion
	/// (`EMFILE`, `ENFILE`, `ENOBUFS`, `ENOMEM`) apart from transient
	/// per-connection failures.
	pub fn accept_nonblocking(&self) -> Result<AcceptResult<D>, SocketError> {
		let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
		let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

		let fd = unsafe {
			libc::accept4(
				self.fd.as_raw_fd(),
				&mut storage as *mut _ as *mut libc::sockaddr,
				&mut len,
				libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
			)
		};

		if fd == -1 {
			let err = errno();
			return match err {
				libc::EAGAIN => Ok(AcceptResult::WouldBlock),
				libc::EINTR => Ok(AcceptResult::Interrupted),
				_ => Err(SocketError::Accept { errno: err }),
			};
		}

		let fd = unsafe { OwnedFd::from_raw_fd(fd) };
		let stream = ConnectedStream::from_fd(fd);

		let addr = unsafe { D::Addr::from_sockaddr(&storage as *const _ as *const libc::sockaddr, len) }
			.ok_or(SocketError::InvalidAddress {
				reason: "invalid client address",
			})?;

		Ok(AcceptResult::Connection(stream, addr))
	}

	/// Returns the address the listener is bound to.
	pub fn local_addr(&self) -> Result<D::Addr, SocketError> {
		super::sockname(self.fd.as_raw_fd(), false)
	}
}

/*
Notice: ListeningSocket<D> has no T: SockType parameter.
By the time you're listening, you are definitely a Stream socket.
*/

impl<D: Domain> AsRawFd for ListeningSocket<D> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl<D: Domain> AsFd for ListeningSocket<D> {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}
