use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::addr::{Domain, FromSockAddr, ToSockAddr};
use crate::error::{SocketError, errno};

/// A bound datagram socket.
///
/// Can send to any address with `send_to`. After `connect()` the kernel
/// filters incoming datagrams to the peer and `send` needs no address.
/// Unlike streams, connecting a datagram socket does not change its type:
/// the same descriptor keeps serving reads.
pub struct DatagramSocket<D: Domain> {
	fd: OwnedFd,
	_marker: PhantomData<D>,
}

impl<D: Domain> DatagramSocket<D> {
	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self {
			fd,
			_marker: PhantomData,
		}
	}

	/// Sends a datagram to the specified address.
	pub fn send_to(&self, buf: &[u8], addr: &D::Addr) -> io::Result<usize> {
		let fd = self.fd.as_raw_fd();
		let n = addr
			.with_raw(|ptr, len| unsafe {
				libc::sendto(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0, ptr, len)
			})
			.ok_or_else(|| io::Error::from(SocketError::InvalidAddress { reason: "address too long" }))?;

		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}

	/// Sends to the connected peer.
	pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe {
			libc::send(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len(), 0)
		};

		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}

	/// Receives one datagram with the sender's address.
	///
	/// Datagrams longer than `buf` are truncated by the kernel.
	pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, D::Addr)> {
		let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
		let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

		let n = unsafe {
			libc::recvfrom(
				self.fd.as_raw_fd(),
				buf.as_mut_ptr() as *mut libc::c_void,
				buf.len(),
				0,
				&mut storage as *mut _ as *mut libc::sockaddr,
				&mut len,
			)
		};

		if n == -1 {
			return Err(io::Error::last_os_error());
		}

		let addr = unsafe { D::Addr::from_sockaddr(&storage as *const _ as *const libc::sockaddr, len) }
			.ok_or_else(|| io::Error::from(SocketError::InvalidAddress { reason: "invalid sender address" }))?;

		Ok((n as usize, addr))
	}

	/// Fixes the peer. Later reads only see datagrams from `addr`.
	pub fn connect(&self, addr: &D::Addr) -> Result<(), SocketError> {
		let fd = self.fd.as_raw_fd();
		let result = addr.with_raw(|ptr, len| unsafe { libc::connect(fd, ptr, len) });

		match result {
			Some(-1) => Err(SocketError::Connect {
				errno: errno(),
				addr: addr.to_string(),
			}),
			Some(_) => Ok(()),
			None => Err(SocketError::InvalidAddress {
				reason: "address too long",
			}),
		}
	}

	/// Returns the bound local address (resolves port 0).
	pub fn local_addr(&self) -> Result<D::Addr, SocketError> {
		super::sockname(self.fd.as_raw_fd(), false)
	}
}

impl<D: Domain> AsRawFd for DatagramSocket<D> {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl<D: Domain> AsFd for DatagramSocket<D> {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}
