use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::stream::ConnectedStream;
use crate::addr::{Domain, ToSockAddr};
use crate::error::{SocketError, errno};

/// Outcome of one `connect()` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
	/// The handshake finished (or the kernel says we are already connected).
	Connected,
	/// Still in flight; wait for readiness and probe again.
	InProgress,
}

/// A stream socket with a non-blocking `connect()` in flight.
pub struct PendingConnect<D: Domain> {
	fd: OwnedFd,
	_marker: PhantomData<D>,
}

impl<D: Domain> PendingConnect<D> {
	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self {
			fd,
			_marker: PhantomData,
		}
	}

	/// Issues (or re-issues) `connect()`.
	///
	/// `EISCONN` counts as success; `EINPROGRESS`, `EALREADY`, `EAGAIN` and
	/// `EINTR` mean the attempt is still running. Anything else is terminal.
	pub fn poll_connect(&self, addr: &D::Addr) -> Result<ConnectStatus, SocketError> {
		let fd = self.fd.as_raw_fd();
		let result = addr.with_raw(|ptr, len| unsafe { libc::connect(fd, ptr, len) });

		match result {
			Some(0) => Ok(ConnectStatus::Connected),
			Some(_) => match errno() {
				libc::EISCONN => Ok(ConnectStatus::Connected),
				libc::EINPROGRESS | libc::EALREADY | libc::EAGAIN | libc::EINTR => Ok(ConnectStatus::InProgress),
				e => Err(SocketError::Connect { errno: e, addr: addr.to_string() }),
			},
			None => Err(SocketError::InvalidAddress {
				reason: "address too long",
			}),
		}
	}

	/// Reads and clears the socket error status (`SO_ERROR`).
	///
	/// Reading clears the error, so call it once per readiness event.
	pub fn take_error(&self) -> Result<Option<i32>, SocketError> {
		super::options::take_error(self)
	}

	/// Completes the connection. Call once `poll_connect` reported `Connected`.
	pub fn finish(self) -> ConnectedStream<D> {
		ConnectedStream::from_fd(self.fd)
	}
}

/*
  ┌──────────────────────┬───────────────────────────────────┐
  │ connect() result     │ meaning for a non-blocking socket │
  ├──────────────────────┼───────────────────────────────────┤
  │ 0 / EISCONN          │ connected                         │
  ├──────────────────────┼───────────────────────────────────┤
  │ EINPROGRESS/EALREADY │ handshake running, wait for POLLOUT│
  ├──────────────────────┼───────────────────────────────────┤
  │ EAGAIN / EINTR       │ try again on next readiness       │
  ├──────────────────────┼───────────────────────────────────┤
  │ anything else        │ failed, SO_ERROR has the cause    │
  └──────────────────────┴───────────────────────────────────┘
*/

impl<D: Domain> AsRawFd for PendingConnect<D> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}
