//! Typestate wrappers over non-blocking OS sockets.
//!
//! ```text
//! RawSocket ──bind──▶ BoundSocket ──listen──▶ ListeningSocket ──accept──▶ ConnectedStream
//!     │
//!     └──connect_nonblocking──▶ PendingConnect ──finish──▶ ConnectedStream
//!
//! RawSocket<_, Datagram> ──bind_datagram──▶ DatagramSocket
//! ```
//!
//! Every socket is created `O_NONBLOCK | O_CLOEXEC`; nothing here ever
//! waits. Readiness comes from the reactor, one layer up.

mod bound;
mod datagram;
mod listener;
mod options;
mod pending;
mod raw;
mod stream;

pub use self::bound::BoundSocket;
pub use self::datagram::DatagramSocket;
pub use self::listener::{AcceptResult, ListeningSocket};
pub use self::options::{
	get_multicast_interface, get_multicast_loop, get_multicast_ttl, join_multicast_v4,
	leave_multicast_v4, set_keepalive, set_keepalive_count, set_keepalive_idle,
	set_keepalive_interval, set_linger, set_multicast_interface, set_multicast_loop,
	set_multicast_ttl, set_recv_buffer_size, set_reuse_addr, set_reuse_port,
	set_send_buffer_size, set_tcp_nodelay, take_error,
};
pub use self::pending::{ConnectStatus, PendingConnect};
pub use self::raw::RawSocket;
pub use self::stream::{ConnectedStream, Shutdown};

/// Trait for socket type markers.
///
/// - `Stream`: reliable, ordered byte stream (TCP-like)
/// - `Datagram`: unreliable, unordered packets (UDP-like)
pub trait SockType {
	/// Returns the libc constant for this socket type.
	fn raw() -> libc::c_int;
}

/// Stream socket marker.
///
/// Used for TCP (with Ipv4/Ipv6) or Unix stream sockets.
pub struct Stream;

/// Datagram socket marker.
///
/// Used for UDP (with Ipv4/Ipv6) or Unix datagram sockets.
pub struct Datagram;

impl SockType for Stream {
	#[inline]
	fn raw() -> libc::c_int {
		libc::SOCK_STREAM
	}
}

impl SockType for Datagram {
	#[inline]
	fn raw() -> libc::c_int {
		libc::SOCK_DGRAM
	}
}

/// Toggles `O_NONBLOCK` on any descriptor.
pub(crate) fn set_nonblocking_fd(fd: libc::c_int, nonblocking: bool) -> Result<(), crate::SocketError> {
	use crate::error::errno;
	use crate::SocketError;

	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags == -1 {
		return Err(SocketError::GetOption { errno: errno(), option: "F_GETFL" });
	}
	let new_flags = if nonblocking {
		flags | libc::O_NONBLOCK
	} else {
		flags & !libc::O_NONBLOCK
	};
	let result = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
	if result == -1 {
		return Err(SocketError::SetOption { errno: errno(), option: "O_NONBLOCK" });
	}
	Ok(())
}

/// Reads a socket name (`getsockname`/`getpeername`) into a typed address.
pub(crate) fn sockname<A: crate::addr::FromSockAddr>(
	fd: libc::c_int,
	peer: bool,
) -> Result<A, crate::SocketError> {
	use crate::error::errno;
	use crate::SocketError;

	let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
	let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
	let ptr = &mut storage as *mut _ as *mut libc::sockaddr;

	let result = unsafe {
		if peer {
			libc::getpeername(fd, ptr, &mut len)
		} else {
			libc::getsockname(fd, ptr, &mut len)
		}
	};
	if result == -1 {
		let option = if peer { "SO_PEERNAME" } else { "SO_SOCKNAME" };
		return Err(SocketError::GetOption { errno: errno(), option });
	}

	unsafe { A::from_sockaddr(ptr, len) }.ok_or(SocketError::InvalidAddress { reason: "invalid address" })
}
