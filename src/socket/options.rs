use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use crate::error::{SocketError, errno};

fn setsockopt_raw<S: AsRawFd, V>(
	socket: &S,
	level: libc::c_int,
	name: libc::c_int,
	val: &V,
	option: &'static str,
) -> Result<(), SocketError> {
	let result = unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			level,
			name,
			val as *const V as *const libc::c_void,
			std::mem::size_of::<V>() as libc::socklen_t,
		)
	};
	if result == -1 {
		Err(SocketError::SetOption { errno: errno(), option })
	} else {
		Ok(())
	}
}

fn getsockopt_raw<S: AsRawFd, V: Copy>(
	socket: &S,
	level: libc::c_int,
	name: libc::c_int,
	mut val: V,
	option: &'static str,
) -> Result<V, SocketError> {
	let mut len = std::mem::size_of::<V>() as libc::socklen_t;
	let result = unsafe {
		libc::getsockopt(
			socket.as_raw_fd(),
			level,
			name,
			&mut val as *mut V as *mut libc::c_void,
			&mut len,
		)
	};
	if result == -1 {
		Err(SocketError::GetOption { errno: errno(), option })
	} else {
		Ok(val)
	}
}

fn set_flag<S: AsRawFd>(
	socket: &S,
	level: libc::c_int,
	name: libc::c_int,
	enable: bool,
	option: &'static str,
) -> Result<(), SocketError> {
	let val: libc::c_int = if enable { 1 } else { 0 };
	setsockopt_raw(socket, level, name, &val, option)
}

/// Sets SO_REUSEADDR on a socket.
///
/// Allows binding to an address that's in TIME_WAIT state.
/// Essential for server restarts.
pub fn set_reuse_addr<S: AsRawFd>(socket: &S, enable: bool) -> Result<(), SocketError> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable, "SO_REUSEADDR")
}

/// Sets SO_REUSEPORT on a socket.
pub fn set_reuse_port<S: AsRawFd>(socket: &S, enable: bool) -> Result<(), SocketError> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, enable, "SO_REUSEPORT")
}

/// Sets TCP_NODELAY on a socket.
///
/// Disables Nagle's algorithm so small writes go out immediately.
pub fn set_tcp_nodelay<S: AsRawFd>(socket: &S, enable: bool) -> Result<(), SocketError> {
	set_flag(socket, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable, "TCP_NODELAY")
}

/// Sets receive buffer size (SO_RCVBUF).
///
/// Kernel typically doubles this value internally.
pub fn set_recv_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> Result<(), SocketError> {
	let val = size as libc::c_int;
	setsockopt_raw(socket, libc::SOL_SOCKET, libc::SO_RCVBUF, &val, "SO_RCVBUF")
}

/// Sets send buffer size (SO_SNDBUF).
pub fn set_send_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> Result<(), SocketError> {
	let val = size as libc::c_int;
	setsockopt_raw(socket, libc::SOL_SOCKET, libc::SO_SNDBUF, &val, "SO_SNDBUF")
}

/// Enables TCP keep-alive (SO_KEEPALIVE).
///
/// Use with TCP_KEEPIDLE, TCP_KEEPINTVL, TCP_KEEPCNT to tune timing.
pub fn set_keepalive<S: AsRawFd>(socket: &S, enable: bool) -> Result<(), SocketError> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable, "SO_KEEPALIVE")
}

/// Seconds of idleness before the first keep-alive probe.
pub fn set_keepalive_idle<S: AsRawFd>(socket: &S, seconds: u32) -> Result<(), SocketError> {
	let val = seconds as libc::c_int;
	setsockopt_raw(socket, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &val, "TCP_KEEPIDLE")
}

/// Seconds between keep-alive probes.
pub fn set_keepalive_interval<S: AsRawFd>(socket: &S, seconds: u32) -> Result<(), SocketError> {
	let val = seconds as libc::c_int;
	setsockopt_raw(socket, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &val, "TCP_KEEPINTVL")
}

/// Unanswered probes before the connection is dropped.
pub fn set_keepalive_count<S: AsRawFd>(socket: &S, count: u32) -> Result<(), SocketError> {
	let val = count as libc::c_int;
	setsockopt_raw(socket, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &val, "TCP_KEEPCNT")
}

/// Sets SO_LINGER.
///
/// `None` disables lingering; `Some(0)` makes close() send RST.
pub fn set_linger<S: AsRawFd>(socket: &S, linger: Option<u32>) -> Result<(), SocketError> {
	let val = libc::linger {
		l_onoff: linger.is_some() as libc::c_int,
		l_linger: linger.unwrap_or(0) as libc::c_int,
	};
	setsockopt_raw(socket, libc::SOL_SOCKET, libc::SO_LINGER, &val, "SO_LINGER")
}

/// Reads and clears the pending socket error (SO_ERROR).
///
/// `Ok(None)` means no error is pending.
pub fn take_error<S: AsRawFd>(socket: &S) -> Result<Option<i32>, SocketError> {
	let val: libc::c_int = getsockopt_raw(socket, libc::SOL_SOCKET, libc::SO_ERROR, 0, "SO_ERROR")?;
	Ok(if val == 0 { None } else { Some(val) })
}

/*
  Multicast options (IPv4 only):

  ┌─────────────────────┬──────────────┬─────────────────────────────┐
  │ option              │ value type   │ meaning                     │
  ├─────────────────────┼──────────────┼─────────────────────────────┤
  │ IP_MULTICAST_IF     │ in_addr      │ outgoing interface          │
  │ IP_MULTICAST_TTL    │ u8 / int     │ hop limit for sent groups   │
  │ IP_MULTICAST_LOOP   │ u8 / int     │ deliver own sends locally   │
  │ IP_ADD_MEMBERSHIP   │ ip_mreq      │ join group on interface     │
  │ IP_DROP_MEMBERSHIP  │ ip_mreq      │ leave group on interface    │
  └─────────────────────┴──────────────┴─────────────────────────────┘
*/

fn in_addr(ip: Ipv4Addr) -> libc::in_addr {
	libc::in_addr {
		s_addr: u32::from_ne_bytes(ip.octets()),
	}
}

/// Selects the interface used for outgoing multicast.
pub fn set_multicast_interface<S: AsRawFd>(socket: &S, interface: Ipv4Addr) -> Result<(), SocketError> {
	setsockopt_raw(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &in_addr(interface), "IP_MULTICAST_IF")
}

/// Interface used for outgoing multicast, `0.0.0.0` when unset.
pub fn get_multicast_interface<S: AsRawFd>(socket: &S) -> Result<Ipv4Addr, SocketError> {
	let raw = getsockopt_raw(
		socket,
		libc::IPPROTO_IP,
		libc::IP_MULTICAST_IF,
		libc::in_addr { s_addr: 0 },
		"IP_MULTICAST_IF",
	)?;
	Ok(Ipv4Addr::from(raw.s_addr.to_ne_bytes()))
}

pub fn set_multicast_ttl<S: AsRawFd>(socket: &S, ttl: u8) -> Result<(), SocketError> {
	let val = ttl as libc::c_int;
	setsockopt_raw(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &val, "IP_MULTICAST_TTL")
}

pub fn get_multicast_ttl<S: AsRawFd>(socket: &S) -> Result<u8, SocketError> {
	let val: libc::c_int = getsockopt_raw(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 0, "IP_MULTICAST_TTL")?;
	Ok(val as u8)
}

pub fn set_multicast_loop<S: AsRawFd>(socket: &S, enable: bool) -> Result<(), SocketError> {
	set_flag(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, enable, "IP_MULTICAST_LOOP")
}

pub fn get_multicast_loop<S: AsRawFd>(socket: &S) -> Result<bool, SocketError> {
	let val: libc::c_int = getsockopt_raw(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0, "IP_MULTICAST_LOOP")?;
	Ok(val != 0)
}

fn membership<S: AsRawFd>(
	socket: &S,
	group: Ipv4Addr,
	interface: Ipv4Addr,
	name: libc::c_int,
	option: &'static str,
) -> Result<(), SocketError> {
	let mreq = libc::ip_mreq {
		imr_multiaddr: in_addr(group),
		imr_interface: in_addr(interface),
	};
	setsockopt_raw(socket, libc::IPPROTO_IP, name, &mreq, option)
}

/// Joins `group` on `interface` (IP_ADD_MEMBERSHIP).
pub fn join_multicast_v4<S: AsRawFd>(socket: &S, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), SocketError> {
	membership(socket, group, interface, libc::IP_ADD_MEMBERSHIP, "IP_ADD_MEMBERSHIP")
}

/// Leaves `group` on `interface` (IP_DROP_MEMBERSHIP).
pub fn leave_multicast_v4<S: AsRawFd>(socket: &S, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), SocketError> {
	membership(socket, group, interface, libc::IP_DROP_MEMBERSHIP, "IP_DROP_MEMBERSHIP")
}
