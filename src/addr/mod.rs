//! Address families and endpoint values.
//!
//! Three address families are supported:
//! - `Ipv4`: Internet Protocol version 4
//! - `Ipv6`: Internet Protocol version 6
//! - `Unix`: Unix domain sockets (local only)
//!
//! Sockets are typed by family (`RawSocket<Ipv4, Stream>`); protocols and
//! factories see the family-independent [`Address`] instead.

mod ipv4;
mod ipv6;
mod unix;
pub use self::ipv4::{Ipv4, SocketAddrV4};
pub use self::ipv6::{Ipv6, SocketAddrV6};
pub use self::unix::{Unix, UnixAddr};

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

/// Trait for address family markers.
///
/// Each type implementing this trait represents an address family
/// that can be passed to the `socket()` syscall.
pub trait Domain: 'static {
	/// The endpoint type for this family.
	type Addr: SockAddr;

	/// Returns the libc constant for this address family.
	fn raw() -> libc::c_int;

	/// Builds an endpoint from a resolved IP, if this family speaks IP.
	fn from_ip(_ip: IpAddr, _port: u16) -> Option<Self::Addr> {
		None
	}
}

/// Everything a transport needs from a family's endpoint type.
pub trait SockAddr: ToSockAddr + FromSockAddr + Clone + PartialEq + fmt::Debug + fmt::Display + 'static {
	/// Converts to the family-independent form handed to protocols.
	fn to_address(&self, kind: SocketKind) -> Address;

	/// The inverse of `to_address`, for endpoints of this family.
	fn from_address(addr: &Address) -> Option<Self>;
}

/// Trait for address types that can be converted to raw sockaddr for syscalls.
pub trait ToSockAddr {
	/// Calls the provided closure with a pointer to the raw sockaddr and its size.
	/// Returns None if the address is invalid (e.g., path too long for Unix).
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R;
}

/// Trait for address types that can be created from raw sockaddr.
pub trait FromSockAddr: Sized {
	/// Creates address from raw sockaddr storage.
	///
	/// # Safety
	/// The sockaddr must be of the correct family for this type.
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self>;
}

impl FromSockAddr for SocketAddrV4 {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		if len < std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
			return None;
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_in) };
		Some(Self::from_raw(raw))
	}
}

impl FromSockAddr for SocketAddrV6 {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		if len < std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
			return None;
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_in6) };
		Some(Self::from_raw(raw))
	}
}

impl FromSockAddr for UnixAddr {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		let family = std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t;
		if len < family {
			return None;
		}
		// Unnamed sockets (socketpair, unbound clients) carry only the family.
		if len == family {
			return Some(Self::unnamed());
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_un) };
		Some(Self::from_raw(raw, (len - family) as usize))
	}
}

/// Transport flavour recorded in an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
	Tcp,
	Udp,
}

/// An endpoint as seen by protocols and factories.
///
/// `(family tag, host, port)` for IP, `(family tag, path)` for UNIX-domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
	Inet { kind: SocketKind, ip: IpAddr, port: u16 },
	/// A host name that has not been resolved yet.
	Named { kind: SocketKind, host: String, port: u16 },
	/// `path` is `None` for abstract and unnamed sockets.
	Unix { path: Option<PathBuf> },
}

impl Address {
	/// Host part, `"unix"` for UNIX-domain endpoints.
	pub fn host(&self) -> String {
		match self {
			Address::Inet { ip, .. } => ip.to_string(),
			Address::Named { host, .. } => host.clone(),
			Address::Unix { .. } => "unix".into(),
		}
	}

	/// The resolved IP, if this is one.
	pub fn ip(&self) -> Option<IpAddr> {
		match self {
			Address::Inet { ip, .. } => Some(*ip),
			_ => None,
		}
	}

	pub fn port(&self) -> Option<u16> {
		match self {
			Address::Inet { port, .. } | Address::Named { port, .. } => Some(*port),
			Address::Unix { .. } => None,
		}
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Address::Inet { kind, ip: IpAddr::V6(ip), port } => write!(f, "{:?}:[{}]:{}", kind, ip, port),
			Address::Inet { kind, ip, port } => write!(f, "{:?}:{}:{}", kind, ip, port),
			Address::Named { kind, host, port } => write!(f, "{:?}:{}:{}", kind, host, port),
			Address::Unix { path: Some(path) } => write!(f, "UNIX:{}", path.display()),
			Address::Unix { path: None } => f.write_str("UNIX:<unnamed>"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn v4_roundtrips_through_sockaddr() {
		let addr = SocketAddrV4::new([10, 1, 2, 3], 4321);
		let back = addr
			.with_raw(|ptr, len| unsafe { SocketAddrV4::from_sockaddr(ptr, len) })
			.flatten()
			.unwrap();
		assert_eq!(back, addr);
		assert_eq!(back.to_string(), "10.1.2.3:4321");
	}

	#[test]
	fn unix_abstract_length_is_exact() {
		let addr = UnixAddr::abstract_socket(b"lane");
		let len = addr.with_raw(|_, len| len).unwrap() as usize;
		let family = std::mem::size_of::<libc::sa_family_t>();
		assert_eq!(len, family + 1 + 4);
		let back = addr
			.with_raw(|ptr, len| unsafe { UnixAddr::from_sockaddr(ptr, len) })
			.flatten()
			.unwrap();
		assert_eq!(back, addr);
	}

	#[test]
	fn unix_path_too_long_is_rejected() {
		let addr = UnixAddr::new(vec![b'a'; 200]);
		assert!(addr.with_raw(|_, len| len).is_none());
	}

	#[test]
	fn inet_address_display_and_parts() {
		let addr = SocketAddrV4::new([127, 0, 0, 1], 80).to_address(SocketKind::Tcp);
		assert_eq!(addr.host(), "127.0.0.1");
		assert_eq!(addr.port(), Some(80));
		assert_eq!(addr.to_string(), "Tcp:127.0.0.1:80");
		assert_eq!(
			Ipv4::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
			Some(SocketAddrV4::new([127, 0, 0, 1], 9))
		);
		assert_eq!(Unix::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 9), None);
	}

	#[test]
	fn v6_keeps_scope_and_maps_v4_peers() {
		let ip: std::net::Ipv6Addr = "fe80::1".parse().unwrap();
		let addr = SocketAddrV6::with_scope(ip, 5, 2);
		assert_eq!(addr.to_string(), "[fe80::1%2]:5");
		let back = addr
			.with_raw(|ptr, len| unsafe { SocketAddrV6::from_sockaddr(ptr, len) })
			.flatten()
			.unwrap();
		assert_eq!(back.scope_id(), 2);

		let mapped = Ipv6::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 7).unwrap();
		assert_eq!(mapped.ip().to_ipv4_mapped(), Some(Ipv4Addr::LOCALHOST));
	}

	#[test]
	fn abstract_unix_address_has_no_path() {
		let addr = UnixAddr::abstract_socket(b"x").to_address(SocketKind::Tcp);
		assert_eq!(addr, Address::Unix { path: None });
		let addr = UnixAddr::from_str("/tmp/s").to_address(SocketKind::Tcp);
		assert_eq!(addr, Address::Unix { path: Some("/tmp/s".into()) });
		assert_eq!(addr.host(), "unix");
	}
}
