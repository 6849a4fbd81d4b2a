use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use tracing::debug;

use super::DatagramPort;
use crate::addr::Ipv4;
use crate::deferred::Deferred;
use crate::error::{DatagramError, MulticastJoinError};
use crate::reactor::Reactor;
use crate::socket::{
	get_multicast_interface, get_multicast_loop, get_multicast_ttl, join_multicast_v4, leave_multicast_v4,
	set_multicast_interface, set_multicast_loop, set_multicast_ttl,
};

/// Outcome of an asynchronous multicast change.
pub type MulticastResult = Deferred<Result<(), MulticastJoinError>>;

/// Resolves `name` to an IPv4 address. Literals and the empty string
/// (any interface) answer immediately; names go through the reactor.
fn resolve_v4(reactor: &Rc<dyn Reactor>, name: &str, done: impl FnOnce(Option<Ipv4Addr>) + 'static) {
	if name.is_empty() {
		return done(Some(Ipv4Addr::UNSPECIFIED));
	}
	if let Ok(ip) = name.parse::<Ipv4Addr>() {
		return done(Some(ip));
	}
	reactor.resolve(
		name,
		Box::new(move |ip| {
			done(match ip {
				Some(IpAddr::V4(ip)) => Some(ip),
				_ => None,
			})
		}),
	);
}

impl DatagramPort<Ipv4> {
	pub fn get_outgoing_interface(&self) -> Result<Ipv4Addr, DatagramError> {
		self.with_socket(get_multicast_interface)
	}

	/// Selects the interface used for outgoing multicast, resolving
	/// `interface` first.
	pub fn set_outgoing_interface(self: &Rc<Self>, interface: &str) -> MulticastResult {
		let result = Deferred::new();
		let (port, done, name) = (Rc::downgrade(self), result.clone(), interface.to_owned());
		resolve_v4(&self.reactor, interface, move |ip| {
			let Some(ip) = ip else {
				return done.fire(Err(MulticastJoinError::Resolve { name }));
			};
			let Some(port) = port.upgrade() else { return };
			done.fire(port.with_socket(|s| set_multicast_interface(s, ip)).map_err(|e| MulticastJoinError::Os {
				group: String::from("-"),
				interface: ip.to_string(),
				errno: datagram_errno(&e),
			}));
		});
		result
	}

	pub fn get_loopback_mode(&self) -> Result<bool, DatagramError> {
		self.with_socket(get_multicast_loop)
	}

	pub fn set_loopback_mode(&self, enable: bool) -> Result<(), DatagramError> {
		self.with_socket(|s| set_multicast_loop(s, enable))
	}

	pub fn get_ttl(&self) -> Result<u8, DatagramError> {
		self.with_socket(get_multicast_ttl)
	}

	pub fn set_ttl(&self, ttl: u8) -> Result<(), DatagramError> {
		self.with_socket(|s| set_multicast_ttl(s, ttl))
	}

	/// Joins `group` on `interface` (empty for any). Both are resolved
	/// before the membership changes.
	pub fn join_group(self: &Rc<Self>, group: &str, interface: &str) -> MulticastResult {
		self.change_membership(group, interface, true)
	}

	pub fn leave_group(self: &Rc<Self>, group: &str, interface: &str) -> MulticastResult {
		self.change_membership(group, interface, false)
	}

	/// Groups currently joined through this port.
	pub fn joined_groups(&self) -> Vec<Ipv4Addr> {
		self.memberships.borrow().iter().map(|(group, _)| *group).collect()
	}

	fn change_membership(self: &Rc<Self>, group: &str, interface: &str, join: bool) -> MulticastResult {
		let result = Deferred::new();
		let (port, done) = (Rc::downgrade(self), result.clone());
		let (group_name, interface_name) = (group.to_owned(), interface.to_owned());
		let reactor = self.reactor.clone();

		resolve_v4(&self.reactor, group, move |group| {
			let Some(group) = group else {
				return done.fire(Err(MulticastJoinError::Resolve { name: group_name }));
			};
			resolve_v4(&reactor, &interface_name.clone(), move |interface| {
				let Some(interface) = interface else {
					return done.fire(Err(MulticastJoinError::Resolve { name: interface_name }));
				};
				let Some(port) = port.upgrade() else { return };
				done.fire(port.apply_membership(group, interface, join));
			});
		});
		result
	}

	fn apply_membership(&self, group: Ipv4Addr, interface: Ipv4Addr, join: bool) -> Result<(), MulticastJoinError> {
		let changed = if join {
			self.with_socket(|s| join_multicast_v4(s, group, interface))
		} else {
			self.with_socket(|s| leave_multicast_v4(s, group, interface))
		};
		changed.map_err(|e| MulticastJoinError::Os {
			group: group.to_string(),
			interface: interface.to_string(),
			errno: datagram_errno(&e),
		})?;

		let mut memberships = self.memberships.borrow_mut();
		if join {
			memberships.push((group, interface));
		} else if let Some(pos) = memberships.iter().position(|m| *m == (group, interface)) {
			memberships.remove(pos);
		}
		debug!(prefix = %self.prefix(), %group, %interface, join, "multicast membership changed");
		Ok(())
	}
}

fn datagram_errno(err: &DatagramError) -> i32 {
	match err {
		DatagramError::Os { errno } => *errno,
		_ => libc::EBADF,
	}
}
