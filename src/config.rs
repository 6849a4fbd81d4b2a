use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use crate::addr::Domain;
use crate::error::SocketError;
use crate::socket::{
	set_keepalive, set_keepalive_count, set_keepalive_idle, set_keepalive_interval, set_linger,
	set_recv_buffer_size, set_reuse_addr, set_reuse_port, set_send_buffer_size, set_tcp_nodelay,
};

// ============================================================================
// Socket option groups
// ============================================================================

/// Buffer size configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferConfig {
	pub recv: Option<usize>,
	pub send: Option<usize>,
}

impl BufferConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn recv(mut self, size: usize) -> Self {
		self.recv = Some(size);
		self
	}

	pub fn send(mut self, size: usize) -> Self {
		self.send = Some(size);
		self
	}

	pub fn both(mut self, size: usize) -> Self {
		self.recv = Some(size);
		self.send = Some(size);
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S) -> Result<(), SocketError> {
		if let Some(size) = self.recv {
			set_recv_buffer_size(socket, size)?;
		}
		if let Some(size) = self.send {
			set_send_buffer_size(socket, size)?;
		}
		Ok(())
	}
}

/// Address reuse configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReuseConfig {
	pub addr: bool,
	pub port: bool,
}

impl Default for ReuseConfig {
	fn default() -> Self {
		Self {
			addr: true, // Almost always want this for servers
			port: false,
		}
	}
}

impl ReuseConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn addr(mut self, enable: bool) -> Self {
		self.addr = enable;
		self
	}

	pub fn port(mut self, enable: bool) -> Self {
		self.port = enable;
		self
	}

	/// Enable both, for several sockets sharing one port.
	pub fn both(mut self) -> Self {
		self.addr = true;
		self.port = true;
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S) -> Result<(), SocketError> {
		if self.addr {
			set_reuse_addr(socket, true)?;
		}
		if self.port {
			set_reuse_port(socket, true)?;
		}
		Ok(())
	}
}

/// TCP-specific configuration. Ignored for UNIX sockets except `linger`.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
	pub nodelay: bool,
	pub keepalive: Option<KeepaliveConfig>,
	pub linger: Option<Option<u32>>,
}

impl Default for TcpConfig {
	fn default() -> Self {
		Self {
			nodelay: true,
			keepalive: None,
			linger: None,
		}
	}
}

impl TcpConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn nodelay(mut self, enable: bool) -> Self {
		self.nodelay = enable;
		self
	}

	pub fn keepalive(mut self, config: KeepaliveConfig) -> Self {
		self.keepalive = Some(config);
		self
	}

	pub fn linger(mut self, seconds: Option<u32>) -> Self {
		self.linger = Some(seconds);
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S, is_unix: bool) -> Result<(), SocketError> {
		if !is_unix && self.nodelay {
			set_tcp_nodelay(socket, true)?;
		}
		if !is_unix {
			if let Some(config) = self.keepalive {
				set_keepalive(socket, true)?;
				set_keepalive_idle(socket, config.idle_secs)?;
				set_keepalive_interval(socket, config.interval_secs)?;
				set_keepalive_count(socket, config.count)?;
			}
		}
		if let Some(linger) = self.linger {
			set_linger(socket, linger)?;
		}
		Ok(())
	}
}

/// Keep-alive timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
	pub idle_secs: u32,
	pub interval_secs: u32,
	pub count: u32,
}

impl Default for KeepaliveConfig {
	fn default() -> Self {
		Self {
			idle_secs: 60,
			interval_secs: 10,
			count: 5,
		}
	}
}

impl KeepaliveConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn idle(mut self, secs: u32) -> Self {
		self.idle_secs = secs;
		self
	}

	pub fn interval(mut self, secs: u32) -> Self {
		self.interval_secs = secs;
		self
	}

	pub fn count(mut self, count: u32) -> Self {
		self.count = count;
		self
	}
}

// ============================================================================
// Listener
// ============================================================================

/// How many connections a listener accepts per readiness event.
///
/// The budget starts at `initial`, grows by `step` after a pass that used
/// the whole budget, never exceeds `max`, and drops to what was actually
/// accepted (at least 1) as soon as accept would block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptPolicy {
	pub initial: usize,
	pub step: usize,
	pub max: usize,
}

impl Default for AcceptPolicy {
	fn default() -> Self {
		Self {
			initial: 100,
			step: 20,
			max: 1000,
		}
	}
}

impl AcceptPolicy {
	pub fn new() -> Self {
		Self::default()
	}

	/// One accept per readiness event, for event loops that cannot
	/// tolerate batched accepts.
	pub fn single() -> Self {
		Self {
			initial: 1,
			step: 0,
			max: 1,
		}
	}

	pub fn initial(mut self, n: usize) -> Self {
		self.initial = n.max(1);
		self
	}

	pub fn step(mut self, n: usize) -> Self {
		self.step = n;
		self
	}

	pub fn max(mut self, n: usize) -> Self {
		self.max = n.max(1);
		self
	}
}

/// Extra behavior for UNIX-domain listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixListenConfig {
	/// Permission bits applied to the socket file after bind.
	pub mode: Option<u32>,
	/// Keep a `<path>.lock` file holding our pid while listening.
	pub want_pid: bool,
}

impl UnixListenConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mode(mut self, mode: u32) -> Self {
		self.mode = Some(mode);
		self
	}

	pub fn want_pid(mut self, enable: bool) -> Self {
		self.want_pid = enable;
		self
	}
}

/// Listener (`Port`) configuration.
#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
	pub backlog: i32,
	pub reuse: ReuseConfig,
	pub tcp: TcpConfig,
	pub buffers: BufferConfig,
	pub accept: AcceptPolicy,
	/// How long accepting stays paused after descriptor exhaustion.
	pub exhaustion_cooldown: Duration,
	pub unix: UnixListenConfig,
	/// Read buffer size for accepted connections.
	pub read_size: usize,
}

impl Default for PortConfig {
	fn default() -> Self {
		Self {
			backlog: 50,
			reuse: ReuseConfig::default(),
			tcp: TcpConfig::default(),
			buffers: BufferConfig::default(),
			accept: AcceptPolicy::default(),
			exhaustion_cooldown: Duration::from_secs(1),
			unix: UnixListenConfig::default(),
			read_size: 64 * 1024,
		}
	}
}

impl PortConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn backlog(mut self, backlog: i32) -> Self {
		self.backlog = backlog;
		self
	}

	pub fn reuse(mut self, config: ReuseConfig) -> Self {
		self.reuse = config;
		self
	}

	pub fn tcp(mut self, config: TcpConfig) -> Self {
		self.tcp = config;
		self
	}

	pub fn buffers(mut self, config: BufferConfig) -> Self {
		self.buffers = config;
		self
	}

	pub fn accept(mut self, policy: AcceptPolicy) -> Self {
		self.accept = policy;
		self
	}

	pub fn exhaustion_cooldown(mut self, cooldown: Duration) -> Self {
		self.exhaustion_cooldown = cooldown;
		self
	}

	pub fn unix(mut self, config: UnixListenConfig) -> Self {
		self.unix = config;
		self
	}

	pub fn read_size(mut self, size: usize) -> Self {
		self.read_size = size.max(1);
		self
	}
}

// ============================================================================
// Client
// ============================================================================

/// Outbound stream connection configuration.
pub struct ConnectConfig<D: Domain> {
	/// Local address to bind before connecting.
	pub bind: Option<D::Addr>,
	/// Abandon the attempt with `ConnectError::TimedOut` after this long.
	pub timeout: Option<Duration>,
	pub tcp: TcpConfig,
	pub buffers: BufferConfig,
	pub read_size: usize,
}

impl<D: Domain> Default for ConnectConfig<D> {
	fn default() -> Self {
		Self {
			bind: None,
			timeout: Some(Duration::from_secs(30)),
			tcp: TcpConfig::default(),
			buffers: BufferConfig::default(),
			read_size: 64 * 1024,
		}
	}
}

impl<D: Domain> Clone for ConnectConfig<D> {
	fn clone(&self) -> Self {
		Self {
			bind: self.bind.clone(),
			timeout: self.timeout,
			tcp: self.tcp,
			buffers: self.buffers,
			read_size: self.read_size,
		}
	}
}

impl<D: Domain> ConnectConfig<D> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn bind(mut self, addr: D::Addr) -> Self {
		self.bind = Some(addr);
		self
	}

	pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn tcp(mut self, config: TcpConfig) -> Self {
		self.tcp = config;
		self
	}

	pub fn buffers(mut self, config: BufferConfig) -> Self {
		self.buffers = config;
		self
	}

	pub fn read_size(mut self, size: usize) -> Self {
		self.read_size = size.max(1);
		self
	}
}

// ============================================================================
// Datagram
// ============================================================================

/// UDP port configuration.
#[derive(Debug, Clone, Copy)]
pub struct DatagramConfig {
	/// Largest datagram accepted by `write` and read per event.
	pub max_packet_size: usize,
	pub reuse: Option<ReuseConfig>,
	pub buffers: BufferConfig,
	/// Allow several ports on one group address (SO_REUSEADDR + SO_REUSEPORT).
	pub listen_multiple: bool,
}

impl Default for DatagramConfig {
	fn default() -> Self {
		Self {
			max_packet_size: 8192,
			reuse: None,
			buffers: BufferConfig::default(),
			listen_multiple: false,
		}
	}
}

impl DatagramConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn max_packet_size(mut self, size: usize) -> Self {
		self.max_packet_size = size;
		self
	}

	pub fn reuse(mut self, config: ReuseConfig) -> Self {
		self.reuse = Some(config);
		self
	}

	pub fn buffers(mut self, config: BufferConfig) -> Self {
		self.buffers = config;
		self
	}

	pub fn listen_multiple(mut self, enable: bool) -> Self {
		self.listen_multiple = enable;
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S) -> Result<(), SocketError> {
		let reuse = if self.listen_multiple {
			Some(ReuseConfig::new().both())
		} else {
			self.reuse
		};
		if let Some(reuse) = reuse {
			reuse.apply(socket)?;
		}
		self.buffers.apply(socket)
	}
}

// ============================================================================
// Process
// ============================================================================

/// What the child finds at one of its descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFd {
	/// A pipe the parent writes and the child reads.
	ToChild,
	/// A pipe the child writes and the parent reads.
	FromChild,
	/// The parent's own descriptor, shared with the child.
	Inherit(RawFd),
}

/// What to run and how.
///
/// `args[0]` is passed as the program's own name; the executable itself is
/// `program`, looked up as a path (no `PATH` search).
#[derive(Debug, Clone)]
pub struct SpawnConfig {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	/// `None` inherits the parent's environment.
	pub env: Option<Vec<(OsString, OsString)>>,
	pub cwd: Option<PathBuf>,
	pub uid: Option<u32>,
	pub gid: Option<u32>,
	/// Child descriptor layout. Defaults to stdin, stdout and stderr on
	/// pipes. Standard descriptors left out of the map are closed in the
	/// child.
	pub child_fds: BTreeMap<RawFd, ChildFd>,
}

impl SpawnConfig {
	pub fn new<P: Into<PathBuf>>(program: P) -> Self {
		let program = program.into();
		Self {
			args: vec![program.clone().into_os_string()],
			program,
			env: None,
			cwd: None,
			uid: None,
			gid: None,
			child_fds: BTreeMap::from([(0, ChildFd::ToChild), (1, ChildFd::FromChild), (2, ChildFd::FromChild)]),
		}
	}

	pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<OsString>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
		self.env.get_or_insert_with(Vec::new).push((key.into(), value.into()));
		self
	}

	pub fn cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
		self.cwd = Some(dir.into());
		self
	}

	pub fn uid(mut self, uid: u32) -> Self {
		self.uid = Some(uid);
		self
	}

	pub fn gid(mut self, gid: u32) -> Self {
		self.gid = Some(gid);
		self
	}

	/// Sets up child descriptor `fd`, replacing whatever was there.
	pub fn child_fd(mut self, fd: RawFd, kind: ChildFd) -> Self {
		self.child_fds.insert(fd, kind);
		self
	}

	/// Replaces the whole descriptor layout.
	pub fn child_fds<I: IntoIterator<Item = (RawFd, ChildFd)>>(mut self, fds: I) -> Self {
		self.child_fds = fds.into_iter().collect();
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::Ipv4;

	#[test]
	fn defaults_match_documented_values() {
		let port = PortConfig::default();
		assert_eq!(port.backlog, 50);
		assert_eq!(port.accept, AcceptPolicy { initial: 100, step: 20, max: 1000 });
		assert_eq!(port.exhaustion_cooldown, Duration::from_secs(1));

		let connect = ConnectConfig::<Ipv4>::default();
		assert_eq!(connect.timeout, Some(Duration::from_secs(30)));
		assert!(connect.bind.is_none());

		assert_eq!(DatagramConfig::default().max_packet_size, 8192);
	}

	#[test]
	fn single_accept_policy_is_fixed() {
		let policy = AcceptPolicy::single();
		assert_eq!(policy.initial, 1);
		assert_eq!(policy.max, 1);
	}

	#[test]
	fn spawn_config_uses_program_as_argv0() {
		let config = SpawnConfig::new("/bin/echo").arg("hi");
		assert_eq!(config.args, vec![OsString::from("/bin/echo"), OsString::from("hi")]);
	}

	#[test]
	fn spawn_config_extra_fds_keep_standard_streams() {
		let config = SpawnConfig::new("/bin/sh").child_fd(3, ChildFd::FromChild);
		let layout: Vec<_> = config.child_fds.into_iter().collect();
		assert_eq!(
			layout,
			vec![(0, ChildFd::ToChild), (1, ChildFd::FromChild), (2, ChildFd::FromChild), (3, ChildFd::FromChild)]
		);

		let replaced = SpawnConfig::new("/bin/sh").child_fds([(1, ChildFd::FromChild)]);
		assert_eq!(replaced.child_fds.len(), 1);
	}
}
