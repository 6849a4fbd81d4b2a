use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use crate::addr::{Address, Domain, SockAddr, SocketKind, ToSockAddr};

/// `AF_INET6`. IPv4 peers resolve to their v4-mapped form.
pub struct Ipv6;

impl Domain for Ipv6 {
	type Addr = SocketAddrV6;

	#[inline]
	fn raw() -> libc::c_int {
		libc::AF_INET6
	}

	fn from_ip(ip: IpAddr, port: u16) -> Option<SocketAddrV6> {
		let ip = match ip {
			IpAddr::V6(ip) => ip,
			IpAddr::V4(ip) => ip.to_ipv6_mapped(),
		};
		Some(SocketAddrV6::new(ip, port))
	}
}

/// An IPv6 endpoint. The scope id only matters for link-local (`fe80::/10`)
/// addresses, where it names the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddrV6 {
	ip: Ipv6Addr,
	port: u16,
	scope_id: u32,
}

impl SocketAddrV6 {
	pub fn new(ip: impl Into<Ipv6Addr>, port: u16) -> Self {
		Self::with_scope(ip, port, 0)
	}

	pub fn with_scope(ip: impl Into<Ipv6Addr>, port: u16, scope_id: u32) -> Self {
		Self {
			ip: ip.into(),
			port,
			scope_id,
		}
	}

	/// `[::1]:port`.
	pub fn localhost(port: u16) -> Self {
		Self::new(Ipv6Addr::LOCALHOST, port)
	}

	pub fn ip(&self) -> Ipv6Addr {
		self.ip
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn scope_id(&self) -> u32 {
		self.scope_id
	}

	pub(crate) fn from_raw(raw: &libc::sockaddr_in6) -> Self {
		Self::with_scope(raw.sin6_addr.s6_addr, u16::from_be(raw.sin6_port), raw.sin6_scope_id)
	}

	pub(crate) fn to_raw(&self) -> libc::sockaddr_in6 {
		libc::sockaddr_in6 {
			sin6_family: libc::AF_INET6 as libc::sa_family_t,
			sin6_port: self.port.to_be(),
			sin6_flowinfo: 0,
			sin6_addr: libc::in6_addr {
				s6_addr: self.ip.octets(),
			},
			sin6_scope_id: self.scope_id,
		}
	}
}

impl fmt::Display for SocketAddrV6 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.scope_id == 0 {
			write!(f, "[{}]:{}", self.ip, self.port)
		} else {
			write!(f, "[{}%{}]:{}", self.ip, self.scope_id, self.port)
		}
	}
}

impl ToSockAddr for SocketAddrV6 {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		let raw = self.to_raw();
		Some(f(
			&raw as *const libc::sockaddr_in6 as *const libc::sockaddr,
			std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
		))
	}
}

impl SockAddr for SocketAddrV6 {
	fn to_address(&self, kind: SocketKind) -> Address {
		Address::Inet {
			kind,
			ip: IpAddr::V6(self.ip),
			port: self.port,
		}
	}

	fn from_address(addr: &Address) -> Option<Self> {
		match addr {
			Address::Inet { ip: IpAddr::V6(ip), port, .. } => Some(Self::new(*ip, *port)),
			_ => None,
		}
	}
}
