use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::listener::ListeningSocket;
use super::{SockType, Stream};
use crate::addr::Domain;
use crate::error::{SocketError, errno};

/// A socket that has been bound to an address but not yet listening.
///
/// Same structure as RawSocket. Different name = different capabilities.
pub struct BoundSocket<D: Domain, T: SockType> {
	fd: OwnedFd,
	_marker: PhantomData<(D, T)>,
}

impl<D: Domain, T: SockType> BoundSocket<D, T> {
	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self {
			fd,
			_marker: PhantomData,
		}
	}

	/// Returns the address actually bound (resolves port 0).
	pub fn local_addr(&self) -> Result<D::Addr, SocketError> {
		super::sockname(self.fd.as_raw_fd(), false)
	}
}

impl<D: Domain> BoundSocket<D, Stream> {
	/// Transitions to a listening socket.
	///
	/// `backlog` is the maximum length of the pending connection queue.
	pub fn listen(self, backlog: i32) -> Result<ListeningSocket<D>, SocketError> {
		let result = unsafe { libc::listen(self.fd.as_raw_fd(), backlog) };

		if result == -1 {
			return Err(SocketError::Listen { errno: errno(), backlog });
		}

		Ok(ListeningSocket::from_fd(self.fd))
	}
}

impl<D: Domain, T: SockType> AsRawFd for BoundSocket<D, T> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}
