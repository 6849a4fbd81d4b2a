use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::addr::{Address, Domain, SockAddr, SocketKind, ToSockAddr};

/// `AF_INET`.
pub struct Ipv4;

impl Domain for Ipv4 {
	type Addr = SocketAddrV4;

	#[inline]
	fn raw() -> libc::c_int {
		libc::AF_INET
	}

	fn from_ip(ip: IpAddr, port: u16) -> Option<SocketAddrV4> {
		match ip {
			IpAddr::V4(ip) => Some(SocketAddrV4::new(ip, port)),
			IpAddr::V6(_) => None,
		}
	}
}

/// An IPv4 endpoint as the kernel sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddrV4 {
	ip: Ipv4Addr,
	port: u16,
}

impl SocketAddrV4 {
	pub fn new(ip: impl Into<Ipv4Addr>, port: u16) -> Self {
		Self { ip: ip.into(), port }
	}

	/// `0.0.0.0:port`, every interface.
	pub fn any(port: u16) -> Self {
		Self::new(Ipv4Addr::UNSPECIFIED, port)
	}

	/// `127.0.0.1:port`.
	pub fn localhost(port: u16) -> Self {
		Self::new(Ipv4Addr::LOCALHOST, port)
	}

	pub fn ip(&self) -> Ipv4Addr {
		self.ip
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub(crate) fn from_raw(raw: &libc::sockaddr_in) -> Self {
		// s_addr is already in network order
		Self::new(raw.sin_addr.s_addr.to_ne_bytes(), u16::from_be(raw.sin_port))
	}

	pub(crate) fn to_raw(&self) -> libc::sockaddr_in {
		libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: self.port.to_be(),
			sin_addr: libc::in_addr {
				s_addr: u32::from_ne_bytes(self.ip.octets()),
			},
			sin_zero: [0; 8],
		}
	}
}

impl From<std::net::SocketAddrV4> for SocketAddrV4 {
	fn from(addr: std::net::SocketAddrV4) -> Self {
		Self::new(*addr.ip(), addr.port())
	}
}

impl fmt::Display for SocketAddrV4 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.ip, self.port)
	}
}

impl ToSockAddr for SocketAddrV4 {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		let raw = self.to_raw();
		Some(f(
			&raw as *const libc::sockaddr_in as *const libc::sockaddr,
			std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
		))
	}
}

impl SockAddr for SocketAddrV4 {
	fn to_address(&self, kind: SocketKind) -> Address {
		Address::Inet {
			kind,
			ip: IpAddr::V4(self.ip),
			port: self.port,
		}
	}

	fn from_address(addr: &Address) -> Option<Self> {
		match addr {
			Address::Inet { ip: IpAddr::V4(ip), port, .. } => Some(Self::new(*ip, *port)),
			_ => None,
		}
	}
}
